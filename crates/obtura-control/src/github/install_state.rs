//! One-shot state tokens binding an installation round-trip to a tenant.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::clock::Clock;

pub const INSTALL_STATE_TTL_SECS: i64 = 10 * 60;

#[derive(Debug, Clone, Copy)]
struct PendingInstall {
    company_id: Uuid,
    expires_at: DateTime<Utc>,
}

/// Process-local state store. Replicas behind a load balancer need a shared
/// backend instead.
#[derive(Clone)]
pub struct InstallStateStore {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    states: Arc<DashMap<String, PendingInstall>>,
}

impl InstallStateStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(Duration::seconds(INSTALL_STATE_TTL_SECS), clock)
    }

    pub fn with_ttl(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            ttl,
            states: Arc::new(DashMap::new()),
        }
    }

    /// Issue a fresh unguessable state for `company_id`.
    pub fn issue(&self, company_id: Uuid) -> String {
        let now = self.clock.now();
        self.states.retain(|_, pending| pending.expires_at > now);

        let state = hex::encode(rand::random::<[u8; 32]>());
        self.states.insert(
            state.clone(),
            PendingInstall {
                company_id,
                expires_at: now + self.ttl,
            },
        );
        state
    }

    /// Consume a state. Returns the bound company only if the state was
    /// issued, not yet used, and not expired; any lookup removes it.
    pub fn consume(&self, state: &str) -> Option<Uuid> {
        let (_, pending) = self.states.remove(state)?;
        (pending.expires_at > self.clock.now()).then_some(pending.company_id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
