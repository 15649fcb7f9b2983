pub mod builds;
pub mod github;
pub mod health;
pub mod installations;
pub mod members;

use axum::{middleware, Router};

use crate::auth;
use crate::state::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    // Public routes; the GitHub routes authenticate through path tokens or
    // webhook signatures themselves.
    let public = Router::new()
        .merge(health::router())
        .merge(github::router());

    // Bearer-session routes
    let authenticated = Router::new()
        .merge(builds::router())
        .merge(members::router())
        .merge(installations::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    Router::new()
        .merge(public)
        .nest("/api/v1", authenticated)
        .with_state(state)
}
