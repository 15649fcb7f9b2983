//! Per-installation access token cache with single-flight minting.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::provider::{InstallationToken, ProviderError};
use crate::clock::Clock;

/// Upper bound on how long a minted token is reused.
pub const TOKEN_CACHE_TTL_SECS: i64 = 50 * 60;

/// Tokens this close to the provider-side expiry are treated as stale.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct InstallationTokenCache {
    clock: Arc<dyn Clock>,
    max_ttl: Duration,
    tokens: Arc<DashMap<i64, CachedToken>>,
    mint_locks: Arc<DashMap<i64, Arc<Mutex<()>>>>,
}

impl InstallationTokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            max_ttl: Duration::seconds(TOKEN_CACHE_TTL_SECS),
            tokens: Arc::new(DashMap::new()),
            mint_locks: Arc::new(DashMap::new()),
        }
    }

    fn fresh(&self, installation_id: i64) -> Option<String> {
        let now = self.clock.now();
        self.tokens
            .remove_if(&installation_id, |_, cached| cached.expires_at <= now);
        self.tokens
            .get(&installation_id)
            .map(|cached| cached.token.clone())
    }

    /// Return a cached token, or run `mint` once for all concurrent callers
    /// waiting on the same installation.
    pub async fn get_or_mint<F, Fut>(&self, installation_id: i64, mint: F) -> Result<String, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<InstallationToken, ProviderError>>,
    {
        if let Some(token) = self.fresh(installation_id) {
            return Ok(token);
        }

        let lock = self
            .mint_locks
            .entry(installation_id)
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if let Some(token) = self.fresh(installation_id) {
            return Ok(token);
        }

        let minted = mint().await?;
        let now = self.clock.now();
        let expires_at = (now + self.max_ttl)
            .min(minted.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS));
        if expires_at > now {
            self.tokens.insert(
                installation_id,
                CachedToken {
                    token: minted.token.clone(),
                    expires_at,
                },
            );
        }
        Ok(minted.token)
    }

    pub fn evict(&self, installation_id: i64) {
        self.tokens.remove(&installation_id);
        // Keep the lock while a mint is in flight for this installation.
        self.mint_locks
            .remove_if(&installation_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
