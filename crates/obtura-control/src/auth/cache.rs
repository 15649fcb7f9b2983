//! Short-lived cache of materialized permission sets keyed by (user, company).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::membership::PermissionSet;

/// Default lifetime of a cached permission set.
pub const PERMISSION_CACHE_TTL_SECS: i64 = 300;

#[derive(Clone)]
pub struct PermissionCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    inner: Arc<DashMap<(Uuid, Uuid), CachedPermissions>>,
}

#[derive(Clone)]
struct CachedPermissions {
    expires_at: DateTime<Utc>,
    permissions: Arc<PermissionSet>,
}

impl PermissionCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn with_default_ttl(clock: Arc<dyn Clock>) -> Self {
        Self::new(Duration::seconds(PERMISSION_CACHE_TTL_SECS), clock)
    }

    /// Fresh entry for the pair, if any. Stale entries are evicted on read.
    pub fn get(&self, user_id: Uuid, company_id: Uuid) -> Option<Arc<PermissionSet>> {
        let key = (user_id, company_id);
        let now = self.clock.now();
        {
            let entry = self.inner.get(&key)?;
            if entry.expires_at > now {
                return Some(entry.permissions.clone());
            }
        }
        self.inner.remove_if(&key, |_, entry| entry.expires_at <= now);
        None
    }

    pub fn insert(&self, user_id: Uuid, company_id: Uuid, permissions: Arc<PermissionSet>) {
        let expires_at = self.clock.now() + self.ttl;
        self.inner.insert(
            (user_id, company_id),
            CachedPermissions {
                expires_at,
                permissions,
            },
        );
    }

    /// Drop entries matching the given filters; no filters clears everything.
    pub fn invalidate(&self, user_id: Option<Uuid>, company_id: Option<Uuid>) {
        match (user_id, company_id) {
            (Some(user), Some(company)) => {
                self.inner.remove(&(user, company));
            }
            (Some(user), None) => self.inner.retain(|(u, _), _| *u != user),
            (None, Some(company)) => self.inner.retain(|(_, c), _| *c != company),
            (None, None) => self.inner.clear(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
