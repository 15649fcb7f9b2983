use std::sync::Arc;

use crate::auth::PermissionResolver;
use crate::clock::Clock;
use crate::db::PgPool;
use crate::dispatch::BuildQueue;
use crate::github::VcsGateway;
use crate::store::CredentialStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CredentialStore>,
    pub resolver: PermissionResolver,
    pub gateway: VcsGateway,
    pub queue: BuildQueue,
    pub clock: Arc<dyn Clock>,
    /// Present when backed by PostgreSQL; probed by the readiness check.
    pub db: Option<PgPool>,
}
