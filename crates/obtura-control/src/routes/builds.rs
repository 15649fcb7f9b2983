use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::TenantContext;
use crate::error::ApiError;
use crate::models::build::{BuildRequest, BuildTrigger};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/projects/{project_id}/builds", post(trigger_build))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerBuildRequest {
    pub branch: String,
    pub commit_hash: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerBuildResponse {
    pub build_id: Uuid,
}

async fn trigger_build(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(project_id): Path<Uuid>,
    Json(req): Json<TriggerBuildRequest>,
) -> Result<(StatusCode, Json<TriggerBuildResponse>), ApiError> {
    ctx.require_permission("build", "create")?;

    let branch = req.branch.trim();
    if branch.is_empty() {
        return Err(ApiError::BadRequest("branch is required".into()));
    }

    let project = state
        .store
        .find_project(project_id, ctx.membership.company_id)
        .await?
        .ok_or(ApiError::ProjectNotFound)?;

    let commit_hash = match req.commit_hash.filter(|c| !c.trim().is_empty()) {
        Some(commit) => commit,
        None => state
            .gateway
            .branch_head(&project, branch)
            .await?
            .ok_or_else(|| ApiError::BadRequest(format!("branch {branch} not found")))?,
    };

    let request = BuildRequest::new(
        project.id,
        commit_hash,
        branch,
        BuildTrigger::Manual,
        Some(ctx.identity.user_id),
        state.clock.now(),
    );
    let build_id = state.gateway.dispatcher().dispatch(request).await?;

    Ok((StatusCode::ACCEPTED, Json(TriggerBuildResponse { build_id })))
}
