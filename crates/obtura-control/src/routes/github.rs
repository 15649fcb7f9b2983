use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::TenantContext;
use crate::error::ApiError;
use crate::github::{Branch, WebhookEnvelope};
use crate::models::installation::Installation;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/installation-url/{access_token}", get(installation_url))
        .route("/installation/callback", get(installation_callback))
        .route("/installations/{access_token}", get(list_installations))
        .route("/webhook", post(webhook))
        .route(
            "/repository-branches/{access_token}/{repo}/{owner}/{installation_id}",
            get(repository_branches),
        )
}

#[derive(Debug, Serialize)]
struct InstallationUrlResponse {
    #[serde(rename = "installationURL")]
    installation_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallbackQuery {
    installation_id: Option<i64>,
    setup_action: Option<String>,
    state: Option<String>,
}

#[derive(Debug, Serialize)]
struct CallbackResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct InstallationsResponse {
    installations: Vec<Installation>,
}

#[derive(Debug, Serialize)]
struct BranchesResponse {
    branches: Vec<Branch>,
}

async fn session_from_path(state: &AppState, access_token: &str) -> Result<TenantContext, ApiError> {
    Ok(state.resolver.tenant_context(access_token).await?)
}

async fn installation_url(
    State(state): State<AppState>,
    Path(access_token): Path<String>,
) -> Result<Json<InstallationUrlResponse>, ApiError> {
    let ctx = session_from_path(&state, &access_token).await?;
    let installation_url = state.gateway.begin_installation(ctx.membership.company_id);
    Ok(Json(InstallationUrlResponse { installation_url }))
}

async fn installation_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<CallbackResponse>, ApiError> {
    let installation_id = query
        .installation_id
        .ok_or_else(|| ApiError::BadRequest("installationId is required".into()))?;
    let install_state = query
        .state
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::InvalidOrExpiredState)?;

    let installation = state
        .gateway
        .complete_installation(installation_id, &install_state)
        .await?;

    tracing::debug!(
        installation_id,
        setup_action = query.setup_action.as_deref().unwrap_or("-"),
        "Installation callback handled"
    );
    Ok(Json(CallbackResponse {
        success: true,
        message: format!(
            "Connected {} with {} repositories",
            installation.account_login,
            installation.repositories.len()
        ),
    }))
}

async fn list_installations(
    State(state): State<AppState>,
    Path(access_token): Path<String>,
) -> Result<Json<InstallationsResponse>, ApiError> {
    let ctx = session_from_path(&state, &access_token).await?;
    let installations = state
        .gateway
        .list_installations(ctx.membership.company_id)
        .await?;
    Ok(Json(InstallationsResponse { installations }))
}

async fn repository_branches(
    State(state): State<AppState>,
    Path((access_token, repo, owner, installation_id)): Path<(String, String, String, i64)>,
) -> Result<Json<BranchesResponse>, ApiError> {
    let ctx = session_from_path(&state, &access_token).await?;
    let branches = state
        .gateway
        .repository_branches(ctx.membership.company_id, installation_id, &owner, &repo)
        .await?;
    Ok(Json(BranchesResponse { branches }))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Provider webhook. Answers 200 for every verified delivery so handler
/// failures do not cause redelivery storms.
async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let envelope = WebhookEnvelope {
        event: header(&headers, "x-github-event"),
        delivery_id: header(&headers, "x-github-delivery"),
        signature: header(&headers, "x-hub-signature-256"),
        payload: body,
    };

    let outcome = state.gateway.process_webhook(&envelope).await?;
    tracing::debug!(
        delivery = envelope.delivery_id.as_deref().unwrap_or("-"),
        outcome = ?outcome,
        "Webhook processed"
    );
    Ok(StatusCode::OK)
}
