#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

use obtura_control::auth::PermissionResolver;
use obtura_control::clock::{Clock, ManualClock};
use obtura_control::dispatch::{
    BrokerChannel, BrokerConnector, BrokerError, BuildDispatcher, BuildQueue, FailureSignal,
    PublishOptions, QueueSettings,
};
use obtura_control::github::{
    Branch, InstallationAccount, InstallationToken, ProviderError, VcsGateway, VcsProvider,
};
use obtura_control::models::installation::{Installation, Repository};
use obtura_control::models::project::Project;
use obtura_control::models::session::SessionRecord;
use obtura_control::routes;
use obtura_control::state::AppState;
use obtura_control::store::{CredentialStore, MemoryCredentialStore};

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

pub fn repo(id: i64, name: &str) -> Repository {
    Repository {
        id,
        name: name.to_string(),
        full_name: format!("acme/{name}"),
        private: false,
    }
}

/// In-memory stand-in for the GitHub API.
#[derive(Default)]
pub struct FakeProvider {
    pub mints: AtomicUsize,
    pub repositories: Mutex<Vec<Repository>>,
    pub branches: Mutex<HashMap<String, Vec<Branch>>>,
}

impl FakeProvider {
    pub fn mint_count(&self) -> usize {
        self.mints.load(Ordering::SeqCst)
    }

    pub fn set_branches(&self, owner: &str, repo: &str, branches: &[(&str, &str)]) {
        self.branches.lock().unwrap().insert(
            format!("{owner}/{repo}"),
            branches
                .iter()
                .map(|(name, sha)| Branch {
                    name: name.to_string(),
                    commit_sha: sha.to_string(),
                    protected: false,
                })
                .collect(),
        );
    }
}

#[async_trait]
impl VcsProvider for FakeProvider {
    fn installation_url(&self, state: &str) -> String {
        format!("https://github.test/apps/obtura/installations/new?state={state}")
    }

    async fn installation_account(&self, _installation_id: i64) -> Result<InstallationAccount, ProviderError> {
        Ok(InstallationAccount {
            login: "acme".into(),
            account_type: "Organization".into(),
        })
    }

    async fn mint_installation_token(&self, installation_id: i64) -> Result<InstallationToken, ProviderError> {
        let n = self.mints.fetch_add(1, Ordering::SeqCst);
        Ok(InstallationToken {
            token: format!("ghs_{installation_id}_{n}"),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        })
    }

    async fn list_repositories(&self, _token: &str) -> Result<Vec<Repository>, ProviderError> {
        Ok(self.repositories.lock().unwrap().clone())
    }

    async fn list_branches(&self, _token: &str, owner: &str, repo: &str) -> Result<Vec<Branch>, ProviderError> {
        Ok(self
            .branches
            .lock()
            .unwrap()
            .get(&format!("{owner}/{repo}"))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct RecordingChannel {
    pub fail: AtomicBool,
    pub published: Mutex<Vec<(String, Bytes)>>,
}

#[async_trait]
impl BrokerChannel for RecordingChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        _options: &PublishOptions,
    ) -> Result<(), BrokerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("broker refused message".into()));
        }
        self.published
            .lock()
            .unwrap()
            .push((format!("{exchange}.{routing_key}"), payload));
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

pub struct SharedChannelConnector(pub Arc<RecordingChannel>);

#[async_trait]
impl BrokerConnector for SharedChannelConnector {
    async fn connect(&self, _failure: FailureSignal) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        Ok(self.0.clone())
    }
}

/// A seeded member with a live session.
pub struct Member {
    pub token: String,
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub role_id: Uuid,
}

pub struct Harness {
    pub store: MemoryCredentialStore,
    pub clock: Arc<ManualClock>,
    pub provider: Arc<FakeProvider>,
    pub channel: Arc<RecordingChannel>,
    pub state: AppState,
}

impl Harness {
    pub async fn new() -> Self {
        let store = MemoryCredentialStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let provider = Arc::new(FakeProvider::default());
        let channel = Arc::new(RecordingChannel::default());

        let queue = BuildQueue::new(
            Arc::new(SharedChannelConnector(channel.clone())),
            QueueSettings {
                max_reconnect_attempts: 3,
                reconnect_delay: Duration::from_millis(20),
                operation_timeout: Duration::from_secs(2),
            },
            Arc::new(|_: &BrokerError| {}),
        );
        queue.connect().await.unwrap();

        let dispatcher = BuildDispatcher::new(Arc::new(store.clone()), queue.clone());
        let gateway = VcsGateway::new(
            Arc::new(store.clone()),
            provider.clone(),
            dispatcher,
            WEBHOOK_SECRET,
            clock.clone(),
        );

        let state = AppState {
            store: Arc::new(store.clone()),
            resolver: PermissionResolver::new(Arc::new(store.clone()), clock.clone()),
            gateway,
            queue,
            clock: clock.clone(),
            db: None,
        };

        Self {
            store,
            clock,
            provider,
            channel,
            state,
        }
    }

    pub fn app(&self) -> Router {
        routes::router(self.state.clone())
    }

    pub async fn add_member(
        &self,
        token: &str,
        company_id: Uuid,
        level: i32,
        permissions: &[(&str, &str)],
    ) -> Member {
        let user_id = Uuid::new_v4();
        let role_id = Uuid::new_v4();
        self.store
            .insert_role(role_id, company_id, &format!("level-{level}"), level, permissions)
            .await;
        self.store.add_member(user_id, company_id, role_id).await;

        let now = self.clock.now();
        self.store
            .insert_session(SessionRecord {
                token: token.to_string(),
                user_id,
                user_status: "active".into(),
                created_at: now,
                expires_at: now + ChronoDuration::hours(12),
                last_used_at: None,
            })
            .await;

        Member {
            token: token.to_string(),
            user_id,
            company_id,
            role_id,
        }
    }

    /// Link an installation to `company_id` directly, skipping the callback flow.
    pub async fn link_installation(&self, installation_id: i64, company_id: Uuid) {
        let now = self.clock.now();
        self.store
            .upsert_installation(&Installation {
                installation_id,
                company_id,
                account_login: "acme".into(),
                account_type: "Organization".into(),
                repositories: vec![repo(1, "api")],
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.channel.published.lock().unwrap().clone()
    }
}

pub fn project(company_id: Uuid, installation_id: i64, repository_url: &str) -> Project {
    Project {
        id: Uuid::new_v4(),
        company_id,
        name: "api".into(),
        repository_url: Some(repository_url.into()),
        installation_id: Some(installation_id),
        production_branch: Some("main".into()),
        staging_branch: Some("develop".into()),
        development_branch: None,
        auto_deploy_production: true,
        auto_deploy_staging: false,
        auto_deploy_development: false,
    }
}

pub async fn send(app: Router, request: Request<Body>) -> (axum::http::StatusCode, serde_json::Value) {
    let response: Response<Body> = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, body)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn authed(method: &str, uri: &str, token: &str, json: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(json.to_string()))
        .unwrap()
}

pub fn webhook(event: &str, payload: &[u8], signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("x-github-event", event)
        .header("x-github-delivery", Uuid::new_v4().to_string())
        .header("x-hub-signature-256", signature)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_vec()))
        .unwrap()
}

/// Pull the `state` query parameter out of an installation URL.
pub fn state_param(url: &str) -> String {
    url.split("state=").nth(1).unwrap().to_string()
}
