#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use axum::http::StatusCode;

use common::{get, send, Harness};
use obtura_control::dispatch::ConnectionState;

#[tokio::test]
async fn liveness_and_readiness() {
    let h = Harness::new().await;

    let (status, _) = send(h.app(), get("/health")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(h.app(), get("/health/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["broker"], "ok");
    assert_eq!(h.state.queue.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn readiness_degrades_after_queue_close() {
    let h = Harness::new().await;
    h.state.queue.close().await;

    let (status, body) = send(h.app(), get("/health/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["broker"], "error");
}
