//! Persisted wallet keys
//!
//! Values are JSON-encoded strings behind a [`KeyValueStore`]. Keys are
//! namespaced with `local:wallet_`; per-address keys embed the address.
//! [`WalletStorage`] gives the fixed keys typed accessors and owns the
//! password-expiry check.

use crate::error::{RelayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Prefix applied to every persisted key
pub const KEY_PREFIX: &str = "local:wallet_";

pub const PASSWORD: &str = "password";
pub const PASSWORD_TIME: &str = "passwordTime";
pub const NETWORK: &str = "network";
pub const ENV: &str = "env";
pub const HAS_WALLET: &str = "hasWallet";
pub const LANGUAGE: &str = "language";
pub const TRANSCENDING_MODE: &str = "selectedTranscendingMode";

/// Origins granted account access; lives outside the wallet namespace
pub const AUTHORIZED_ORIGINS_KEY: &str = "local:authorized_origins";

/// How long an unlocked password stays valid by default
pub const PASSWORD_TTL: Duration = Duration::from_secs(5 * 60);

/// Trait for key/value storage backends
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// List all stored keys
    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory store for testing
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

/// JSON file store
///
/// The whole map lives in one file, rewritten through a temporary file on
/// every change.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub const FILE_NAME: &'static str = "wallet_storage.json";

    /// Open (creating the directory if needed) a store under `dir`
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            path: dir.join(Self::FILE_NAME),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| RelayError::Storage(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let data = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp, perms).await?;
        }

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), value);
        self.write_all(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        if entries.remove(key).is_some() {
            self.write_all(&entries).await?;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.read_all().await?.into_keys().collect())
    }
}

/// Bitcoin network the wallet talks to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Livenet,
    Testnet,
}

/// How assets move between chains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscendingMode {
    #[default]
    Poolswap,
    Lightning,
}

/// Outcome of the password-expiry check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    /// No password stored
    Locked,
    /// Password stored and still fresh
    Active { remaining_secs: i64 },
    /// Password was stale and has been cleared
    Expired,
}

/// Typed access to the persisted wallet keys
#[derive(Clone)]
pub struct WalletStorage {
    store: Arc<dyn KeyValueStore>,
    password_ttl: Duration,
}

impl WalletStorage {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            password_ttl: PASSWORD_TTL,
        }
    }

    pub fn with_password_ttl(mut self, ttl: Duration) -> Self {
        self.password_ttl = ttl;
        self
    }

    fn full_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    /// Read and decode a value; undecodable values read as absent
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.store.get(&Self::full_key(key)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "Ignoring undecodable stored value");
                Ok(None)
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set(&Self::full_key(key), raw).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.store.remove(&Self::full_key(key)).await
    }

    // ------------------------------------------------------------------
    // Password
    // ------------------------------------------------------------------

    pub async fn password(&self) -> Result<Option<String>> {
        self.get(PASSWORD).await
    }

    /// Epoch milliseconds of the last password update
    pub async fn password_time(&self) -> Result<Option<i64>> {
        self.get(PASSWORD_TIME).await
    }

    /// Store the password and stamp `passwordTime`; `None` clears both
    pub async fn set_password(&self, password: Option<&str>) -> Result<()> {
        self.set_password_at(password, Utc::now()).await
    }

    pub async fn set_password_at(&self, password: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        match password {
            Some(password) => {
                self.set(PASSWORD, password).await?;
                self.set(PASSWORD_TIME, &now.timestamp_millis()).await
            }
            None => {
                self.remove(PASSWORD).await?;
                self.remove(PASSWORD_TIME).await
            }
        }
    }

    /// Clear a stale password
    pub async fn check_session(&self) -> Result<SessionStatus> {
        self.check_session_at(Utc::now()).await
    }

    pub async fn check_session_at(&self, now: DateTime<Utc>) -> Result<SessionStatus> {
        if self.password().await?.is_none() {
            return Ok(SessionStatus::Locked);
        }

        let ttl_ms = self.password_ttl.as_millis() as i64;
        let age_ms = match self.password_time().await? {
            Some(stamp) => now.timestamp_millis().saturating_sub(stamp),
            None => i64::MAX,
        };

        // A stamp from the future is as untrustworthy as a missing one
        if age_ms > ttl_ms || age_ms < 0 {
            self.set_password_at(None, now).await?;
            info!(age_ms, "Password expired, wallet locked");
            return Ok(SessionStatus::Expired);
        }

        debug!(age_ms, "Password still valid");
        Ok(SessionStatus::Active {
            remaining_secs: ttl_ms.saturating_sub(age_ms) / 1000,
        })
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn network(&self) -> Result<Network> {
        Ok(self.get(NETWORK).await?.unwrap_or_default())
    }

    pub async fn set_network(&self, network: Network) -> Result<()> {
        self.set(NETWORK, &network).await
    }

    pub async fn env(&self) -> Result<Option<String>> {
        self.get(ENV).await
    }

    pub async fn set_env(&self, env: &str) -> Result<()> {
        self.set(ENV, env).await
    }

    pub async fn has_wallet(&self) -> Result<bool> {
        Ok(self.get(HAS_WALLET).await?.unwrap_or(false))
    }

    pub async fn set_has_wallet(&self, has_wallet: bool) -> Result<()> {
        self.set(HAS_WALLET, &has_wallet).await
    }

    pub async fn language(&self) -> Result<Option<String>> {
        self.get(LANGUAGE).await
    }

    pub async fn set_language(&self, language: &str) -> Result<()> {
        self.set(LANGUAGE, language).await
    }

    /// Selected mode; unknown stored values read as the default
    pub async fn transcending_mode(&self) -> Result<TranscendingMode> {
        Ok(self.get(TRANSCENDING_MODE).await?.unwrap_or_default())
    }

    pub async fn set_transcending_mode(&self, mode: TranscendingMode) -> Result<()> {
        self.set(TRANSCENDING_MODE, &mode).await
    }

    // ------------------------------------------------------------------
    // Authorized origins
    // ------------------------------------------------------------------

    pub async fn authorized_origins(&self) -> Result<Vec<String>> {
        let Some(raw) = self.store.get(AUTHORIZED_ORIGINS_KEY).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(origins) => Ok(origins),
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable origin list");
                Ok(Vec::new())
            }
        }
    }

    pub async fn is_origin_authorized(&self, origin: &str) -> Result<bool> {
        Ok(self.authorized_origins().await?.iter().any(|o| o == origin))
    }

    /// Grant `origin` account access; granting twice is a no-op
    pub async fn add_authorized_origin(&self, origin: &str) -> Result<()> {
        let mut origins = self.authorized_origins().await?;
        if origins.iter().any(|o| o == origin) {
            return Ok(());
        }
        origins.push(origin.to_string());
        let raw = serde_json::to_string(&origins)?;
        self.store.set(AUTHORIZED_ORIGINS_KEY, raw).await
    }

    /// Withdraw access; returns whether the origin was listed
    pub async fn remove_authorized_origin(&self, origin: &str) -> Result<bool> {
        let mut origins = self.authorized_origins().await?;
        let before = origins.len();
        origins.retain(|o| o != origin);
        if origins.len() == before {
            return Ok(false);
        }
        let raw = serde_json::to_string(&origins)?;
        self.store.set(AUTHORIZED_ORIGINS_KEY, raw).await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Per-address keys
    // ------------------------------------------------------------------

    pub async fn user_name(&self, address: &str) -> Result<Option<String>> {
        self.get(&format!("user_name_{address}")).await
    }

    pub async fn set_user_name(&self, address: &str, name: &str) -> Result<()> {
        self.set(&format!("user_name_{address}"), name).await
    }

    pub async fn referrer_names(&self, address: &str) -> Result<Vec<String>> {
        Ok(self
            .get(&format!("referrer_names_{address}"))
            .await?
            .unwrap_or_default())
    }

    /// Record a referrer name registered by `address`; duplicates are ignored
    pub async fn add_referrer_name(&self, address: &str, name: &str) -> Result<()> {
        let mut names = self.referrer_names(address).await?;
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
            self.set(&format!("referrer_names_{address}"), &names).await?;
        }
        Ok(())
    }

    pub async fn bound_referrer(&self, address: &str) -> Result<Option<String>> {
        self.get(&format!("bound_referrer_{address}")).await
    }

    pub async fn bound_referrer_txid(&self, address: &str) -> Result<Option<String>> {
        self.get(&format!("bound_referrer_txid_{address}")).await
    }

    /// Bind `address` to a referrer, optionally with the binding transaction
    pub async fn bind_referrer(&self, address: &str, referrer: &str, txid: Option<&str>) -> Result<()> {
        self.set(&format!("bound_referrer_{address}"), referrer).await?;
        match txid {
            Some(txid) => self.set(&format!("bound_referrer_txid_{address}"), txid).await,
            None => self.remove(&format!("bound_referrer_txid_{address}")).await,
        }
    }
}
