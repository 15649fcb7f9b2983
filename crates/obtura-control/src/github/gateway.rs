//! VCS integration gateway: installation lifecycle, installation tokens and
//! webhook routing.

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use super::install_state::InstallStateStore;
use super::provider::{Branch, ProviderError, VcsProvider};
use super::token_cache::InstallationTokenCache;
use super::webhook::{
    plan_push_builds, verify_signature, InstallationAction, PullRequestAction, PullRequestEvent,
    PushEvent, WebhookEvent,
};
use crate::clock::Clock;
use crate::dispatch::BuildDispatcher;
use crate::models::build::{BuildRequest, BuildTrigger};
use crate::models::installation::{Installation, Repository};
use crate::models::project::{parse_owner_repo, Project};
use crate::store::{CredentialStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid or expired state")]
    InvalidOrExpiredState,
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("installation not found")]
    InstallationNotFound,
    #[error("installation is linked to another tenant")]
    InstallationConflict,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Raw webhook delivery as received over HTTP.
#[derive(Debug, Clone)]
pub struct WebhookEnvelope {
    pub event: Option<String>,
    pub delivery_id: Option<String>,
    pub signature: Option<String>,
    pub payload: Bytes,
}

/// What a verified delivery did. Sub-handler failures are reported as
/// `Rejected` rather than errors so the provider still sees success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Acknowledged,
    Ignored,
    InstallationRemoved { installation_id: i64 },
    RepositoriesSynced { installation_id: i64, repositories: usize },
    BuildsDispatched { build_ids: Vec<Uuid>, failed: usize },
    Rejected(String),
}

#[derive(Clone)]
pub struct VcsGateway {
    store: Arc<dyn CredentialStore>,
    provider: Arc<dyn VcsProvider>,
    tokens: InstallationTokenCache,
    states: InstallStateStore,
    dispatcher: BuildDispatcher,
    webhook_secret: Arc<[u8]>,
    clock: Arc<dyn Clock>,
}

impl VcsGateway {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        provider: Arc<dyn VcsProvider>,
        dispatcher: BuildDispatcher,
        webhook_secret: &str,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            provider,
            tokens: InstallationTokenCache::new(clock.clone()),
            states: InstallStateStore::new(clock.clone()),
            dispatcher,
            webhook_secret: Arc::from(webhook_secret.as_bytes()),
            clock,
        }
    }

    pub fn tokens(&self) -> &InstallationTokenCache {
        &self.tokens
    }

    pub fn dispatcher(&self) -> &BuildDispatcher {
        &self.dispatcher
    }

    /// Issue a state bound to `company_id` and return the provider URL that
    /// starts the installation.
    pub fn begin_installation(&self, company_id: Uuid) -> String {
        let state = self.states.issue(company_id);
        tracing::info!(tenant_id = %company_id, "Issued installation state");
        self.provider.installation_url(&state)
    }

    /// Finish the installation round-trip. The state is consumed whether or
    /// not the rest succeeds.
    pub async fn complete_installation(
        &self,
        installation_id: i64,
        state: &str,
    ) -> Result<Installation, GatewayError> {
        let company_id = self
            .states
            .consume(state)
            .ok_or(GatewayError::InvalidOrExpiredState)?;

        // An installation already linked elsewhere is never relinked by a callback.
        let existing = self.store.find_installation(installation_id).await?;
        if let Some(previous) = existing.as_ref().filter(|i| i.company_id != company_id) {
            tracing::warn!(
                installation_id,
                linked_tenant = %previous.company_id,
                tenant_id = %company_id,
                "Rejected installation callback for installation linked to another tenant"
            );
            return Err(GatewayError::InstallationConflict);
        }

        let account = self.provider.installation_account(installation_id).await?;
        let token = self.installation_token(installation_id).await?;
        let repositories = self.provider.list_repositories(&token).await?;

        let now = self.clock.now();
        let installation = Installation {
            installation_id,
            company_id,
            account_login: account.login,
            account_type: account.account_type,
            repositories,
            created_at: existing.map(|i| i.created_at).unwrap_or(now),
            updated_at: now,
        };
        if !self.store.upsert_installation(&installation).await? {
            tracing::warn!(installation_id, tenant_id = %company_id, "Installation claimed by another tenant during callback");
            return Err(GatewayError::InstallationConflict);
        }

        tracing::info!(
            installation_id,
            tenant_id = %company_id,
            repositories = installation.repositories.len(),
            "Installation linked"
        );
        Ok(installation)
    }

    /// Installation-scoped access token, minted on demand and cached.
    pub async fn installation_token(&self, installation_id: i64) -> Result<String, GatewayError> {
        let provider = self.provider.clone();
        self.tokens
            .get_or_mint(installation_id, move || async move {
                provider.mint_installation_token(installation_id).await
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_installations(&self, company_id: Uuid) -> Result<Vec<Installation>, GatewayError> {
        Ok(self.store.list_installations(company_id).await?)
    }

    async fn owned_installation(
        &self,
        company_id: Uuid,
        installation_id: i64,
    ) -> Result<Installation, GatewayError> {
        self.store
            .find_installation(installation_id)
            .await?
            .filter(|i| i.company_id == company_id)
            .ok_or(GatewayError::InstallationNotFound)
    }

    pub async fn repository_branches(
        &self,
        company_id: Uuid,
        installation_id: i64,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<Branch>, GatewayError> {
        self.owned_installation(company_id, installation_id).await?;
        let token = self.installation_token(installation_id).await?;
        Ok(self.provider.list_branches(&token, owner, repo).await?)
    }

    /// Head commit of `branch` in the project's linked repository.
    pub async fn branch_head(&self, project: &Project, branch: &str) -> Result<Option<String>, GatewayError> {
        let installation_id = project
            .installation_id
            .ok_or_else(|| GatewayError::Malformed("project has no linked installation".into()))?;
        let (owner, repo) = project
            .repository_url
            .as_deref()
            .and_then(parse_owner_repo)
            .ok_or_else(|| GatewayError::Malformed("project has no repository url".into()))?;

        let branches = self
            .repository_branches(project.company_id, installation_id, &owner, &repo)
            .await?;
        Ok(branches
            .into_iter()
            .find(|b| b.name == branch)
            .map(|b| b.commit_sha))
    }

    pub async fn remove_installation(&self, company_id: Uuid, installation_id: i64) -> Result<(), GatewayError> {
        self.owned_installation(company_id, installation_id).await?;
        self.store.delete_installation(installation_id).await?;
        self.tokens.evict(installation_id);
        tracing::info!(installation_id, tenant_id = %company_id, "Installation removed");
        Ok(())
    }

    /// Verify and route a webhook delivery. Only a signature mismatch is an
    /// error; everything after verification resolves to an outcome.
    pub async fn process_webhook(&self, envelope: &WebhookEnvelope) -> Result<WebhookOutcome, GatewayError> {
        if !verify_signature(
            &self.webhook_secret,
            &envelope.payload,
            envelope.signature.as_deref(),
        ) {
            tracing::warn!(
                delivery = envelope.delivery_id.as_deref().unwrap_or("-"),
                event = envelope.event.as_deref().unwrap_or("-"),
                "Rejected webhook with invalid signature"
            );
            return Err(GatewayError::InvalidSignature);
        }

        let Some(name) = envelope.event.as_deref() else {
            tracing::debug!("Webhook without event header ignored");
            return Ok(WebhookOutcome::Ignored);
        };

        let event = match WebhookEvent::parse(name, &envelope.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(event = name, error = %e, "Malformed webhook payload");
                return Ok(WebhookOutcome::Rejected(format!("malformed {name} payload")));
            }
        };

        let result = match event {
            WebhookEvent::Installation {
                action,
                installation_id,
                account_login,
            } => self.on_installation(action, installation_id, account_login).await,
            WebhookEvent::InstallationRepositories {
                installation_id,
                added,
                removed,
            } => {
                self.on_installation_repositories(installation_id, &added, &removed)
                    .await
            }
            WebhookEvent::Push(push) => self.on_push(&push).await,
            WebhookEvent::PullRequest(pr) => Ok(self.on_pull_request(&pr)),
            WebhookEvent::Unsupported(name) => {
                tracing::debug!(event = %name, "Unhandled webhook event");
                Ok(WebhookOutcome::Ignored)
            }
        };

        Ok(result.unwrap_or_else(|e| {
            tracing::warn!(event = name, error = %e, "Webhook handler failed");
            WebhookOutcome::Rejected(e.to_string())
        }))
    }

    async fn on_installation(
        &self,
        action: InstallationAction,
        installation_id: i64,
        account_login: Option<String>,
    ) -> Result<WebhookOutcome, GatewayError> {
        match action {
            InstallationAction::Created => {
                // The callback flow creates the record.
                tracing::info!(installation_id, account = account_login.as_deref().unwrap_or("-"), "Installation created");
                Ok(WebhookOutcome::Acknowledged)
            }
            InstallationAction::Deleted => {
                let removed = self.store.delete_installation(installation_id).await?;
                self.tokens.evict(installation_id);
                tracing::info!(installation_id, removed, "Installation deleted");
                Ok(WebhookOutcome::InstallationRemoved { installation_id })
            }
            InstallationAction::Other(action) => {
                tracing::debug!(installation_id, action = %action, "Installation event ignored");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn on_installation_repositories(
        &self,
        installation_id: i64,
        added: &[Repository],
        removed: &[Repository],
    ) -> Result<WebhookOutcome, GatewayError> {
        let merged = self
            .store
            .merge_installation_repositories(installation_id, added, removed)
            .await?
            .ok_or(GatewayError::InstallationNotFound)?;

        tracing::info!(
            installation_id,
            added = added.len(),
            removed = removed.len(),
            total = merged.len(),
            "Installation repositories updated"
        );
        Ok(WebhookOutcome::RepositoriesSynced {
            installation_id,
            repositories: merged.len(),
        })
    }

    async fn on_push(&self, push: &PushEvent) -> Result<WebhookOutcome, GatewayError> {
        let installation_id = push
            .installation_id
            .ok_or_else(|| GatewayError::Malformed("push without installation".into()))?;

        let projects = self
            .store
            .list_projects_for_installation(installation_id)
            .await?;
        let plans = plan_push_builds(push, &projects);
        if plans.is_empty() {
            tracing::debug!(
                installation_id,
                git_ref = %push.git_ref,
                repository = %push.repository_full_name,
                "Push matched no auto-deploy project"
            );
            return Ok(WebhookOutcome::BuildsDispatched {
                build_ids: Vec::new(),
                failed: 0,
            });
        }

        let now = self.clock.now();
        let dispatches = plans.into_iter().map(|plan| {
            let request = BuildRequest::new(
                plan.project_id,
                plan.commit,
                plan.branch,
                BuildTrigger::Push,
                None,
                now,
            );
            tracing::debug!(
                project_id = %plan.project_id,
                environment = plan.environment.as_str(),
                "Push triggers build"
            );
            self.dispatcher.dispatch(request)
        });

        let mut build_ids = Vec::new();
        let mut failed = 0;
        for result in futures::future::join_all(dispatches).await {
            match result {
                Ok(id) => build_ids.push(id),
                Err(e) => {
                    failed += 1;
                    tracing::warn!(installation_id, error = %e, "Push build dispatch failed");
                }
            }
        }
        Ok(WebhookOutcome::BuildsDispatched { build_ids, failed })
    }

    fn on_pull_request(&self, pr: &PullRequestEvent) -> WebhookOutcome {
        match &pr.action {
            PullRequestAction::Opened | PullRequestAction::Synchronize | PullRequestAction::Closed => {
                // Preview environments attach here.
                tracing::info!(
                    installation_id = pr.installation_id,
                    repository = %pr.repository_full_name,
                    number = pr.number,
                    action = ?pr.action,
                    head = %pr.head_branch,
                    sha = %pr.head_sha,
                    "Pull request event"
                );
                WebhookOutcome::Acknowledged
            }
            PullRequestAction::Other(action) => {
                tracing::debug!(number = pr.number, action = %action, "Pull request action ignored");
                WebhookOutcome::Ignored
            }
        }
    }
}
