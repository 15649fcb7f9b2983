use axum::extract::{Path, State};
use axum::routing::put;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{AuthError, TenantContext};
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/members/{user_id}/role", put(update_member_role))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoleRequest {
    pub role_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoleResponse {
    pub user_id: Uuid,
    pub role_id: Uuid,
}

async fn update_member_role(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateRoleRequest>,
) -> Result<Json<UpdateRoleResponse>, ApiError> {
    ctx.require_permission("member", "update")?;

    let company_id = ctx.membership.company_id;
    state
        .resolver
        .can_manage_user(ctx.identity.user_id, user_id, company_id)
        .await?;
    state
        .resolver
        .can_assign_role(ctx.identity.user_id, req.role_id, company_id)
        .await?;

    if !state
        .store
        .update_member_role(user_id, company_id, req.role_id)
        .await?
    {
        return Err(AuthError::TargetNotFound.into());
    }
    state.resolver.invalidate(Some(user_id), Some(company_id));

    tracing::info!(
        tenant_id = %company_id,
        actor = %ctx.identity.user_id,
        user_id = %user_id,
        role_id = %req.role_id,
        "Member role updated"
    );
    Ok(Json(UpdateRoleResponse {
        user_id,
        role_id: req.role_id,
    }))
}
