use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::auth::AuthError;
use crate::dispatch::{BrokerError, DispatchError};
use crate::github::{GatewayError, ProviderError};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(AuthError),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid or expired state")]
    InvalidOrExpiredState,
    #[error("installation not found")]
    InstallationNotFound,
    #[error("installation is linked to another tenant")]
    InstallationConflict,
    #[error("project not found")]
    ProjectNotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(BrokerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Status code and machine-readable error code for the response body.
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Auth(e) => match e {
                AuthError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
                AuthError::AccountInactive => (StatusCode::UNAUTHORIZED, "account_inactive"),
                AuthError::NoTenantContext => (StatusCode::FORBIDDEN, "no_tenant_context"),
                AuthError::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden"),
                AuthError::InsufficientPrivilege => {
                    (StatusCode::FORBIDDEN, "insufficient_privilege")
                }
                AuthError::TargetNotFound => (StatusCode::NOT_FOUND, "target_not_found"),
                AuthError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            },
            ApiError::InvalidSignature => (StatusCode::UNAUTHORIZED, "invalid_signature"),
            ApiError::InvalidOrExpiredState => (StatusCode::BAD_REQUEST, "invalid_or_expired_state"),
            ApiError::InstallationNotFound => (StatusCode::NOT_FOUND, "installation_not_found"),
            ApiError::InstallationConflict => (StatusCode::CONFLICT, "installation_conflict"),
            ApiError::ProjectNotFound => (StatusCode::NOT_FOUND, "project_not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::ChannelUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "channel_unavailable")
            }
            ApiError::Store(_) | ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            ApiError::Provider(_) => (StatusCode::BAD_GATEWAY, "provider_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        }

        let body = serde_json::json!({ "error": code });
        (status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Store(inner) => ApiError::Store(inner),
            other => ApiError::Auth(other),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::InvalidOrExpiredState => ApiError::InvalidOrExpiredState,
            GatewayError::InvalidSignature => ApiError::InvalidSignature,
            GatewayError::InstallationNotFound => ApiError::InstallationNotFound,
            GatewayError::InstallationConflict => ApiError::InstallationConflict,
            GatewayError::Malformed(msg) => ApiError::BadRequest(msg),
            GatewayError::Provider(inner) => ApiError::Provider(inner),
            GatewayError::Store(inner) => ApiError::Store(inner),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Store(inner) => ApiError::Store(inner),
            DispatchError::Queue(inner) => ApiError::ChannelUnavailable(inner),
        }
    }
}
