pub mod cache;
pub mod resolver;

pub use cache::PermissionCache;
pub use resolver::{hierarchy_permits, require_permission, PermissionResolver};

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::models::membership::TenantMembership;
use crate::models::session::Identity;
use crate::state::AppState;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("account inactive")]
    AccountInactive,
    #[error("no tenant context")]
    NoTenantContext,
    #[error("forbidden: {resource}:{action}")]
    Forbidden { resource: String, action: String },
    #[error("insufficient privilege")]
    InsufficientPrivilege,
    #[error("target not found")]
    TargetNotFound,
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),
}

/// Authenticated caller plus the tenant membership resolved for this request.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub identity: Identity,
    pub membership: TenantMembership,
}

impl TenantContext {
    pub fn require_permission(&self, resource: &str, action: &str) -> Result<(), AuthError> {
        require_permission(&self.membership, resource, action)
    }
}

impl PermissionResolver {
    /// Authenticate a token and resolve its tenant in one step.
    pub async fn tenant_context(&self, token: &str) -> Result<TenantContext, AuthError> {
        let identity = self.authenticate(token).await?;
        let membership = self.resolve_tenant_context(&identity).await?;
        Ok(TenantContext {
            identity,
            membership,
        })
    }
}

/// Extract bearer token from the Authorization header (scheme is case-insensitive).
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let auth_header = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = auth_header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Auth middleware: authenticates the bearer session and resolves its tenant.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers()).ok_or(ApiError::Auth(AuthError::Unauthenticated))?;
    let context = state.resolver.tenant_context(token).await?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

impl<S: Send + Sync> FromRequestParts<S> for TenantContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantContext>()
            .cloned()
            .ok_or(ApiError::Auth(AuthError::Unauthenticated))
    }
}
