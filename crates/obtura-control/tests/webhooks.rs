#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::atomic::Ordering;

use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

use common::{project, repo, send, webhook, Harness, WEBHOOK_SECRET};
use obtura_control::github::webhook::sign_payload;
use obtura_control::github::{WebhookEnvelope, WebhookOutcome};
use obtura_control::models::build::{BuildMessage, BuildStatus, BuildTrigger};
use obtura_control::store::CredentialStore;

fn signed(payload: &[u8]) -> String {
    sign_payload(WEBHOOK_SECRET.as_bytes(), payload)
}

fn envelope(event: &str, payload: Vec<u8>) -> WebhookEnvelope {
    WebhookEnvelope {
        event: Some(event.to_string()),
        delivery_id: Some(Uuid::new_v4().to_string()),
        signature: Some(signed(&payload)),
        payload: payload.into(),
    }
}

fn push_payload(installation_id: i64, git_ref: &str, after: &str) -> Vec<u8> {
    json!({
        "ref": git_ref,
        "after": after,
        "deleted": false,
        "repository": {
            "full_name": "acme/api",
            "html_url": "https://github.com/acme/api",
            "clone_url": "https://github.com/acme/api.git",
            "ssh_url": "git@github.com:acme/api.git"
        },
        "installation": { "id": installation_id }
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn tampered_payload_is_rejected() {
    let h = Harness::new().await;
    let original = push_payload(42, "refs/heads/main", "abc123");
    let signature = signed(&original);

    let tampered = push_payload(42, "refs/heads/main", "evil999");
    let (status, body) = send(h.app(), webhook("push", &tampered, &signature)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_signature");

    let (status, _) = send(h.app(), webhook("push", &tampered, "sha256=")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(h.app(), webhook("push", &tampered, &signed(&tampered))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(h.store.builds().await.is_empty());
}

#[tokio::test]
async fn push_to_production_branch_dispatches_one_build() {
    let h = Harness::new().await;
    let company = Uuid::new_v4();
    let p = project(company, 42, "https://github.com/Acme/API.git");
    h.store.insert_project(p.clone()).await;

    let payload = push_payload(42, "refs/heads/main", "abc123");
    let (status, _) = send(h.app(), webhook("push", &payload, &signed(&payload))).await;
    assert_eq!(status, StatusCode::OK);

    let published = h.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "obtura.builds.build.triggered");
    let message: BuildMessage = serde_json::from_slice(&published[0].1).unwrap();
    assert_eq!(message.project_id, p.id);
    assert_eq!(message.commit_hash, "abc123");
    assert_eq!(message.branch, "main");

    let builds = h.store.builds().await;
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].status, BuildStatus::Pending);
    assert_eq!(builds[0].request.trigger, BuildTrigger::Push);
    assert_eq!(builds[0].request.requested_by, None);
}

#[tokio::test]
async fn pushes_without_auto_deploy_match_are_acknowledged_quietly() {
    let h = Harness::new().await;
    let company = Uuid::new_v4();
    h.store
        .insert_project(project(company, 42, "https://github.com/acme/api"))
        .await;

    // staging has auto-deploy off; feature branches and tags never match
    for git_ref in ["refs/heads/develop", "refs/heads/feature/login", "refs/tags/v1.0.0"] {
        let payload = push_payload(42, git_ref, "abc123");
        let (status, _) = send(h.app(), webhook("push", &payload, &signed(&payload))).await;
        assert_eq!(status, StatusCode::OK, "{git_ref}");
    }

    let payload = push_payload(42, "refs/heads/main", "0000000000000000000000000000000000000000");
    let (status, _) = send(h.app(), webhook("push", &payload, &signed(&payload))).await;
    assert_eq!(status, StatusCode::OK);

    // another installation's push does not reach this project
    let payload = push_payload(99, "refs/heads/main", "abc123");
    let (status, _) = send(h.app(), webhook("push", &payload, &signed(&payload))).await;
    assert_eq!(status, StatusCode::OK);

    assert!(h.published().is_empty());
    assert!(h.store.builds().await.is_empty());
}

#[tokio::test]
async fn broker_failure_still_acknowledges_and_marks_build_failed() {
    let h = Harness::new().await;
    h.store
        .insert_project(project(Uuid::new_v4(), 42, "https://github.com/acme/api"))
        .await;
    h.channel.fail.store(true, Ordering::SeqCst);

    let payload = push_payload(42, "refs/heads/main", "abc123");
    let (status, _) = send(h.app(), webhook("push", &payload, &signed(&payload))).await;
    assert_eq!(status, StatusCode::OK);

    let builds = h.store.builds().await;
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].status, BuildStatus::Failed);
    assert!(builds[0].error.is_some());
}

#[tokio::test]
async fn installation_deleted_removes_record_and_token() {
    let h = Harness::new().await;
    let company = Uuid::new_v4();
    h.link_installation(7, company).await;
    h.state.gateway.installation_token(7).await.unwrap();
    assert_eq!(h.state.gateway.tokens().len(), 1);

    let payload = json!({
        "action": "deleted",
        "installation": { "id": 7, "account": { "login": "acme" } }
    })
    .to_string();
    let (status, _) = send(
        h.app(),
        webhook("installation", payload.as_bytes(), &signed(payload.as_bytes())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    assert!(h.store.find_installation(7).await.unwrap().is_none());
    assert!(h.state.gateway.tokens().is_empty());
}

#[tokio::test]
async fn installation_repositories_delta_is_merged() {
    let h = Harness::new().await;
    h.link_installation(7, Uuid::new_v4()).await;

    let payload = json!({
        "action": "added",
        "installation": { "id": 7 },
        "repositories_added": [repo(2, "web"), repo(1, "api")],
        "repositories_removed": []
    })
    .to_string();
    let (status, _) = send(
        h.app(),
        webhook(
            "installation_repositories",
            payload.as_bytes(),
            &signed(payload.as_bytes()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let installation = h.store.find_installation(7).await.unwrap().unwrap();
    assert_eq!(installation.repositories, vec![repo(1, "api"), repo(2, "web")]);

    let payload = json!({
        "action": "removed",
        "installation": { "id": 7 },
        "repositories_removed": [repo(1, "api")]
    })
    .to_string();
    send(
        h.app(),
        webhook(
            "installation_repositories",
            payload.as_bytes(),
            &signed(payload.as_bytes()),
        ),
    )
    .await;
    let installation = h.store.find_installation(7).await.unwrap().unwrap();
    assert_eq!(installation.repositories, vec![repo(2, "web")]);
}

#[tokio::test]
async fn unknown_and_malformed_events_are_acknowledged() {
    let h = Harness::new().await;

    let payload = br#"{"zen":"Keep it logically awesome."}"#;
    let (status, _) = send(h.app(), webhook("ping", payload, &signed(payload))).await;
    assert_eq!(status, StatusCode::OK);

    // verified but unparseable for its event type
    let (status, _) = send(h.app(), webhook("push", payload, &signed(payload))).await;
    assert_eq!(status, StatusCode::OK);

    // repository delta for an installation that was never linked
    let payload = json!({ "installation": { "id": 404 }, "repositories_added": [repo(3, "x")] }).to_string();
    let (status, _) = send(
        h.app(),
        webhook(
            "installation_repositories",
            payload.as_bytes(),
            &signed(payload.as_bytes()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn concurrent_repository_deltas_both_land() {
    let h = Harness::new().await;
    h.link_installation(7, Uuid::new_v4()).await;

    let added = |id: i64, name: &str| {
        envelope(
            "installation_repositories",
            json!({
                "action": "added",
                "installation": { "id": 7 },
                "repositories_added": [repo(id, name)],
                "repositories_removed": []
            })
            .to_string()
            .into_bytes(),
        )
    };
    let (first, second) = (added(2, "web"), added(3, "docs"));
    let gateway = &h.state.gateway;
    let (a, b) = tokio::join!(gateway.process_webhook(&first), gateway.process_webhook(&second));
    assert!(matches!(a.unwrap(), WebhookOutcome::RepositoriesSynced { .. }));
    assert!(matches!(b.unwrap(), WebhookOutcome::RepositoriesSynced { .. }));

    let installation = h.store.find_installation(7).await.unwrap().unwrap();
    assert_eq!(
        installation.repositories,
        vec![repo(1, "api"), repo(2, "web"), repo(3, "docs")]
    );
}

#[tokio::test]
async fn pull_request_events_are_acknowledged_without_side_effects() {
    let h = Harness::new().await;
    let company = Uuid::new_v4();
    h.store
        .insert_project(project(company, 42, "https://github.com/acme/api"))
        .await;
    h.link_installation(42, company).await;
    let before = h.store.find_installation(42).await.unwrap().unwrap();

    let pull_request = |action: &str| {
        json!({
            "action": action,
            "number": 5,
            "pull_request": { "head": { "ref": "feature/x", "sha": "abc123" } },
            "repository": {
                "full_name": "acme/api",
                "html_url": "https://github.com/acme/api"
            },
            "installation": { "id": 42 }
        })
        .to_string()
        .into_bytes()
    };

    let payload = pull_request("opened");
    let (status, _) = send(h.app(), webhook("pull_request", &payload, &signed(&payload))).await;
    assert_eq!(status, StatusCode::OK);

    let outcome = h
        .state
        .gateway
        .process_webhook(&envelope("pull_request", pull_request("synchronize")))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Acknowledged);
    let outcome = h
        .state
        .gateway
        .process_webhook(&envelope("pull_request", pull_request("labeled")))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Ignored);

    assert!(h.published().is_empty());
    assert!(h.store.builds().await.is_empty());
    assert_eq!(h.store.find_installation(42).await.unwrap().unwrap(), before);
}
