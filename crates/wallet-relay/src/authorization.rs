//! Page access control
//!
//! Pages reach the wallet only through the content link. Before anything a
//! page sends is handled in the background, [`PageGate`] checks that a wallet
//! exists and, for account-revealing or spending actions, that the page's
//! origin was granted access through an approved `REQUEST_ACCOUNTS`.
//! Grants persist in [`WalletStorage`]; lookups are cached for five minutes.

use crate::envelope::Envelope;
use crate::error::{ErrorPayload, INTERNAL_ERROR, Result};
use crate::router::Admission;
use crate::storage::WalletStorage;
use crate::types::{LinkName, actions};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long an origin lookup is trusted
pub const AUTH_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Message sent to pages that call gated actions before being granted access
pub const UNAUTHORIZED_ORIGIN: &str = "Unauthorized origin, call REQUEST_ACCOUNTS first";

/// Actions a page may call only from an authorized origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationPolicy {
    actions: HashSet<String>,
}

impl Default for AuthorizationPolicy {
    fn default() -> Self {
        let defaults = [
            actions::GET_ACCOUNTS,
            actions::GET_PUBLIC_KEY,
            actions::GET_BALANCE,
            actions::GET_NETWORK,
            actions::SEND_BITCOIN,
            actions::SIGN_MESSAGE,
            actions::SIGN_PSBT,
            actions::SIGN_PSBTS,
            actions::PUSH_TX,
            actions::PUSH_PSBT,
            actions::GET_INSCRIPTIONS,
            actions::SEND_INSCRIPTION,
            actions::SWITCH_NETWORK,
            actions::SPLIT_ASSET,
            actions::LOCK_UTXO,
            actions::LOCK_UTXO_SATSNET,
            actions::UNLOCK_UTXO,
            actions::UNLOCK_UTXO_SATSNET,
            actions::GET_LOCKED_UTXOS,
            actions::LOCK_TO_CHANNEL,
            actions::UNLOCK_FROM_CHANNEL,
            actions::GET_UTXOS,
            actions::GET_ASSET_BALANCE,
        ];
        Self {
            actions: defaults.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl AuthorizationPolicy {
    /// Policy that gates nothing
    pub fn empty() -> Self {
        Self {
            actions: HashSet::new(),
        }
    }

    pub fn add(&mut self, action: impl Into<String>) {
        self.actions.insert(action.into());
    }

    pub fn remove(&mut self, action: &str) -> bool {
        self.actions.remove(action)
    }

    pub fn requires_authorization(&self, action: &str) -> bool {
        self.actions.contains(action)
    }
}

/// Persisted origin grants with a lookup cache
pub struct OriginAuthorizer {
    storage: WalletStorage,
    policy: AuthorizationPolicy,
    cache: DashMap<String, (bool, Instant)>,
    cache_ttl: Duration,
}

impl OriginAuthorizer {
    pub fn new(storage: WalletStorage) -> Self {
        Self {
            storage,
            policy: AuthorizationPolicy::default(),
            cache: DashMap::new(),
            cache_ttl: AUTH_CACHE_TTL,
        }
    }

    pub fn with_policy(mut self, policy: AuthorizationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn policy(&self) -> &AuthorizationPolicy {
        &self.policy
    }

    pub fn storage(&self) -> &WalletStorage {
        &self.storage
    }

    pub async fn is_authorized(&self, origin: &str) -> Result<bool> {
        if let Some(entry) = self.cache.get(origin) {
            let (authorized, at) = *entry.value();
            if at.elapsed() < self.cache_ttl {
                return Ok(authorized);
            }
        }

        let authorized = self.storage.is_origin_authorized(origin).await?;
        self.cache.insert(origin.to_string(), (authorized, Instant::now()));
        Ok(authorized)
    }

    /// Grant `origin` access and refresh its cached answer
    pub async fn grant(&self, origin: &str) -> Result<()> {
        self.storage.add_authorized_origin(origin).await?;
        self.cache.insert(origin.to_string(), (true, Instant::now()));
        info!(origin, "Origin authorized");
        Ok(())
    }

    /// Withdraw access; returns whether the origin had been granted
    pub async fn revoke(&self, origin: &str) -> Result<bool> {
        let removed = self.storage.remove_authorized_origin(origin).await?;
        self.cache.remove(origin);
        if removed {
            info!(origin, "Origin access revoked");
        }
        Ok(removed)
    }

    /// Forget cached answers for `origin`, or for every origin
    pub fn clear_cache(&self, origin: Option<&str>) {
        match origin {
            Some(origin) => {
                self.cache.remove(origin);
            }
            None => self.cache.clear(),
        }
    }

    /// Drop cache entries older than the cache lifetime
    pub fn cleanup_expired_cache(&self) {
        self.cache.retain(|_, (_, at)| at.elapsed() < self.cache_ttl);
    }

    pub fn cached_origins(&self) -> usize {
        self.cache.len()
    }
}

/// Admission check for envelopes arriving from pages
pub struct PageGate {
    authorizer: Arc<OriginAuthorizer>,
}

impl PageGate {
    pub fn new(authorizer: Arc<OriginAuthorizer>) -> Self {
        Self { authorizer }
    }

    async fn check(&self, envelope: &Envelope) -> Result<std::result::Result<(), ErrorPayload>> {
        if !self.authorizer.storage().has_wallet().await? {
            return Ok(Err(ErrorPayload::no_wallet()));
        }

        if !self.authorizer.policy().requires_authorization(&envelope.action) {
            return Ok(Ok(()));
        }

        let origin = envelope.metadata.as_ref().and_then(|m| m.origin.as_deref());
        let authorized = match origin {
            Some(origin) => self.authorizer.is_authorized(origin).await?,
            None => false,
        };
        if authorized {
            Ok(Ok(()))
        } else {
            debug!(origin = ?origin, action = %envelope.action, "Origin not authorized");
            Ok(Err(ErrorPayload::new(INTERNAL_ERROR, UNAUTHORIZED_ORIGIN)))
        }
    }
}

#[async_trait]
impl Admission for PageGate {
    async fn admit(&self, envelope: &Envelope, via: Option<&LinkName>) -> std::result::Result<(), ErrorPayload> {
        if via.map(LinkName::as_str) != Some(LinkName::CONTENT_BG) {
            return Ok(());
        }

        match self.check(envelope).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(action = %envelope.action, error = %e, "Access check failed");
                Err(ErrorPayload::internal(e.to_string()))
            }
        }
    }
}
