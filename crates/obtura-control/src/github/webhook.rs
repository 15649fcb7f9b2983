//! Webhook signature verification, payload parsing and push-to-deploy
//! planning. Nothing here performs I/O.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::models::installation::Repository;
use crate::models::project::{DeployEnvironment, Project};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";
const NULL_COMMIT: &str = "0000000000000000000000000000000000000000";

/// Verify `X-Hub-Signature-256` over the raw payload bytes. The comparison
/// is constant-time.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature: Option<&str>) -> bool {
    let Some(hex_sig) = signature.and_then(|s| s.trim().strip_prefix(SIGNATURE_PREFIX)) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the signature header value a sender would attach to `payload`.
pub fn sign_payload(secret: &[u8], payload: &[u8]) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallationAction {
    Created,
    Deleted,
    Other(String),
}

impl From<String> for InstallationAction {
    fn from(action: String) -> Self {
        match action.as_str() {
            "created" => Self::Created,
            "deleted" => Self::Deleted,
            _ => Self::Other(action),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullRequestAction {
    Opened,
    Synchronize,
    Closed,
    Other(String),
}

impl From<String> for PullRequestAction {
    fn from(action: String) -> Self {
        match action.as_str() {
            "opened" => Self::Opened,
            "synchronize" => Self::Synchronize,
            "closed" => Self::Closed,
            _ => Self::Other(action),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub installation_id: Option<i64>,
    pub git_ref: String,
    pub commit: String,
    pub deleted: bool,
    pub repository_full_name: String,
    /// Every URL form the provider reported for the pushed repository.
    pub repository_urls: Vec<String>,
}

impl PushEvent {
    /// Branch name for `refs/heads/*` refs; `None` for tags and other refs.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestEvent {
    pub installation_id: Option<i64>,
    pub action: PullRequestAction,
    pub number: u64,
    pub head_branch: String,
    pub head_sha: String,
    pub repository_full_name: String,
}

/// Closed set of webhook events this service routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Installation {
        action: InstallationAction,
        installation_id: i64,
        account_login: Option<String>,
    },
    InstallationRepositories {
        installation_id: i64,
        added: Vec<Repository>,
        removed: Vec<Repository>,
    },
    Push(PushEvent),
    PullRequest(PullRequestEvent),
    Unsupported(String),
}

#[derive(Deserialize)]
struct AccountRef {
    login: String,
}

#[derive(Deserialize)]
struct InstallationRef {
    id: i64,
    account: Option<AccountRef>,
}

#[derive(Deserialize)]
struct RepositoryRef {
    full_name: String,
    html_url: Option<String>,
    clone_url: Option<String>,
    ssh_url: Option<String>,
}

impl RepositoryRef {
    fn urls(self) -> Vec<String> {
        [self.html_url, self.clone_url, self.ssh_url]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[derive(Deserialize)]
struct InstallationPayload {
    action: String,
    installation: InstallationRef,
}

#[derive(Deserialize)]
struct InstallationRepositoriesPayload {
    installation: InstallationRef,
    #[serde(default)]
    repositories_added: Vec<Repository>,
    #[serde(default)]
    repositories_removed: Vec<Repository>,
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    #[serde(default)]
    deleted: bool,
    repository: RepositoryRef,
    installation: Option<InstallationRef>,
}

#[derive(Deserialize)]
struct PullRequestHead {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
}

#[derive(Deserialize)]
struct PullRequestBody {
    head: PullRequestHead,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    action: String,
    number: u64,
    pull_request: PullRequestBody,
    repository: RepositoryRef,
    installation: Option<InstallationRef>,
}

impl WebhookEvent {
    /// Interpret a verified payload according to its `X-GitHub-Event` name.
    pub fn parse(event: &str, payload: &[u8]) -> Result<Self, serde_json::Error> {
        let parsed = match event {
            "installation" => {
                let p: InstallationPayload = serde_json::from_slice(payload)?;
                WebhookEvent::Installation {
                    action: p.action.into(),
                    installation_id: p.installation.id,
                    account_login: p.installation.account.map(|a| a.login),
                }
            }
            "installation_repositories" => {
                let p: InstallationRepositoriesPayload = serde_json::from_slice(payload)?;
                WebhookEvent::InstallationRepositories {
                    installation_id: p.installation.id,
                    added: p.repositories_added,
                    removed: p.repositories_removed,
                }
            }
            "push" => {
                let p: PushPayload = serde_json::from_slice(payload)?;
                WebhookEvent::Push(PushEvent {
                    installation_id: p.installation.map(|i| i.id),
                    git_ref: p.git_ref,
                    commit: p.after,
                    deleted: p.deleted,
                    repository_full_name: p.repository.full_name.clone(),
                    repository_urls: p.repository.urls(),
                })
            }
            "pull_request" => {
                let p: PullRequestPayload = serde_json::from_slice(payload)?;
                WebhookEvent::PullRequest(PullRequestEvent {
                    installation_id: p.installation.map(|i| i.id),
                    action: p.action.into(),
                    number: p.number,
                    head_branch: p.pull_request.head.git_ref,
                    head_sha: p.pull_request.head.sha,
                    repository_full_name: p.repository.full_name,
                })
            }
            other => WebhookEvent::Unsupported(other.to_string()),
        };
        Ok(parsed)
    }
}

/// A build a push should trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBuild {
    pub project_id: Uuid,
    pub environment: DeployEnvironment,
    pub branch: String,
    pub commit: String,
}

/// Decide which projects a push deploys. A project yields at most one build,
/// taking the first environment (production, staging, development) whose
/// branch matches and whose auto-deploy flag is on.
pub fn plan_push_builds(push: &PushEvent, projects: &[Project]) -> Vec<PlannedBuild> {
    if push.deleted || push.commit == NULL_COMMIT {
        return Vec::new();
    }
    let Some(branch) = push.branch() else {
        return Vec::new();
    };

    projects
        .iter()
        .filter(|project| {
            push.repository_urls
                .iter()
                .any(|url| project.repository_matches(url))
        })
        .filter_map(|project| {
            let environment = DeployEnvironment::ALL.into_iter().find(|env| {
                project.branch_for(*env) == Some(branch) && project.auto_deploy(*env)
            })?;
            Some(PlannedBuild {
                project_id: project.id,
                environment,
                branch: branch.to_string(),
                commit: push.commit.clone(),
            })
        })
        .collect()
}
