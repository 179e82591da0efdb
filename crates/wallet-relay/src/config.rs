//! Relay configuration

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retry attempts
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay_ms = self.initial_delay_ms;
        for _ in 1..attempt {
            delay_ms = ((delay_ms as f64 * self.backoff_multiplier) as u64).min(self.max_delay_ms);
        }
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Keep-alive beacon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Ping period in milliseconds
    pub interval_ms: u64,
    /// Unanswered pings tolerated before the link is failed
    pub max_missed: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: 20_000,
            max_missed: 2,
        }
    }
}

impl KeepAliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Per-link connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub handshake_timeout: Duration,
    /// Beacon settings, `None` for links into long-lived hosts
    pub keep_alive: Option<KeepAliveConfig>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(5000),
            keep_alive: None,
        }
    }
}

impl LinkConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, config: KeepAliveConfig) -> Self {
        self.keep_alive = Some(config);
        self
    }
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Handshake bound in milliseconds
    pub handshake_timeout_ms: u64,
    /// Keep-alive settings for links into the background host
    pub keep_alive: KeepAliveConfig,
    /// Enable the beacon on content and popup links
    pub keep_alive_enabled: bool,
    /// Correlated response bound in milliseconds
    pub response_timeout_ms: u64,
    /// How long a shown approval waits for the human
    pub approval_ttl_secs: u64,
    /// Unlocked password lifetime
    pub password_ttl_secs: u64,
    /// Backoff for the keep-alive session supervisor
    pub reconnect: RetryConfig,
    /// Server request timeout in seconds
    pub request_timeout_secs: u64,
    /// Enable CORS on the server for `cors_origins`
    pub cors_enabled: bool,
    /// Origins allowed to call the server from a browser
    pub cors_origins: Vec<String>,
    /// Bearer token for routes that answer approvals; unset closes them
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5000,
            keep_alive: KeepAliveConfig::default(),
            keep_alive_enabled: true,
            response_timeout_ms: 30_000,
            approval_ttl_secs: 300,
            password_ttl_secs: 300,
            reconnect: RetryConfig::default(),
            request_timeout_secs: 30,
            cors_enabled: false,
            cors_origins: Vec::new(),
            api_token: None,
        }
    }
}

impl RelayConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RelayError::InvalidConfig(format!("{}: {e}", path.display())))?;
        let config: RelayConfig = serde_json::from_str(&raw)
            .map_err(|e| RelayError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "handshake_timeout_ms must be positive".to_string(),
            ));
        }
        if self.keep_alive_enabled && self.keep_alive.interval_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "keep_alive.interval_ms must be positive".to_string(),
            ));
        }
        if self.keep_alive.max_missed == 0 {
            return Err(RelayError::InvalidConfig(
                "keep_alive.max_missed must be at least 1".to_string(),
            ));
        }
        if self.cors_enabled && self.cors_origins.is_empty() {
            return Err(RelayError::InvalidConfig(
                "cors_enabled needs at least one entry in cors_origins".to_string(),
            ));
        }
        if self.api_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(RelayError::InvalidConfig(
                "api_token must not be blank".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.handshake_timeout_ms = ms;
        self
    }

    pub fn with_keep_alive(mut self, config: KeepAliveConfig) -> Self {
        self.keep_alive = config;
        self.keep_alive_enabled = true;
        self
    }

    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive_enabled = false;
        self
    }

    pub fn with_response_timeout_ms(mut self, ms: u64) -> Self {
        self.response_timeout_ms = ms;
        self
    }

    pub fn with_approval_ttl_secs(mut self, secs: u64) -> Self {
        self.approval_ttl_secs = secs;
        self
    }

    pub fn with_password_ttl_secs(mut self, secs: u64) -> Self {
        self.password_ttl_secs = secs;
        self
    }

    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Allow browser calls from `origins`
    pub fn with_cors_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cors_origins = origins.into_iter().map(Into::into).collect();
        self.cors_enabled = !self.cors_origins.is_empty();
        self
    }

    pub fn without_cors(mut self) -> Self {
        self.cors_enabled = false;
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn approval_ttl(&self) -> Duration {
        Duration::from_secs(self.approval_ttl_secs)
    }

    pub fn password_ttl(&self) -> Duration {
        Duration::from_secs(self.password_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Link settings for a link into the ephemeral background host
    pub fn background_link(&self) -> LinkConfig {
        let link = LinkConfig::default().with_handshake_timeout(self.handshake_timeout());
        if self.keep_alive_enabled {
            link.with_keep_alive(self.keep_alive.clone())
        } else {
            link
        }
    }

    /// Link settings for a link without a beacon
    pub fn plain_link(&self) -> LinkConfig {
        LinkConfig::default().with_handshake_timeout(self.handshake_timeout())
    }
}
