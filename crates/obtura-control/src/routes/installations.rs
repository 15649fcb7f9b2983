use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::delete;
use axum::Router;

use crate::auth::{AuthError, TenantContext};
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/installations/{installation_id}", delete(remove_installation))
}

/// Owner-only: unlink an installation and drop its cached token.
async fn remove_installation(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(installation_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let company_id = ctx.membership.company_id;
    if !state
        .resolver
        .is_company_owner(company_id, ctx.identity.user_id)
        .await?
    {
        return Err(AuthError::Forbidden {
            resource: "installation".into(),
            action: "delete".into(),
        }
        .into());
    }

    state
        .gateway
        .remove_installation(company_id, installation_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
