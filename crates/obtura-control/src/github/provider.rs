//! GitHub REST client authenticated as the platform app.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::GithubConfig;
use crate::models::installation::Repository;

const PAGE_SIZE: usize = 100;
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "obtura-control";

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider request failed: {0}")]
    Http(reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to sign app token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Http(e)
        }
    }
}

/// Short-lived installation-scoped access token.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationAccount {
    pub login: String,
    pub account_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub name: String,
    pub commit_sha: String,
    pub protected: bool,
}

#[async_trait]
pub trait VcsProvider: Send + Sync {
    /// Browser URL that starts an app installation bound to `state`.
    fn installation_url(&self, state: &str) -> String;
    async fn installation_account(&self, installation_id: i64) -> Result<InstallationAccount, ProviderError>;
    async fn mint_installation_token(&self, installation_id: i64) -> Result<InstallationToken, ProviderError>;
    async fn list_repositories(&self, token: &str) -> Result<Vec<Repository>, ProviderError>;
    async fn list_branches(&self, token: &str, owner: &str, repo: &str) -> Result<Vec<Branch>, ProviderError>;
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct AccountBody {
    login: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct InstallationBody {
    account: AccountBody,
}

#[derive(Deserialize)]
struct RepositoriesPage {
    total_count: usize,
    repositories: Vec<Repository>,
}

#[derive(Deserialize)]
struct BranchCommit {
    sha: String,
}

#[derive(Deserialize)]
struct BranchBody {
    name: String,
    commit: BranchCommit,
    #[serde(default)]
    protected: bool,
}

#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    web_url: String,
    app_id: String,
    app_slug: String,
    signing_key: Arc<EncodingKey>,
    clock: Arc<dyn Clock>,
}

impl GithubClient {
    pub fn new(config: &GithubConfig, timeout: Duration, clock: Arc<dyn Clock>) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        let signing_key = EncodingKey::from_rsa_pem(config.private_key_pem.as_bytes())?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            web_url: config.web_url.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            app_slug: config.app_slug.clone(),
            signing_key: Arc::new(signing_key),
            clock,
        })
    }

    /// RS256 JWT identifying the app itself. Issued a minute in the past to
    /// tolerate clock drift; GitHub rejects lifetimes over ten minutes.
    fn app_jwt(&self) -> Result<String, ProviderError> {
        let now = self.clock.now().timestamp();
        let claims = app_claims(&self.app_id, now);
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.signing_key,
        )?)
    }

    fn request(&self, method: reqwest::Method, path: &str, bearer: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(bearer)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send_json<T: DeserializeOwned>(req: reqwest::RequestBuilder) -> Result<T, ProviderError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

fn app_claims(app_id: &str, now: i64) -> AppClaims {
    AppClaims {
        iat: now - 60,
        exp: now + 9 * 60,
        iss: app_id.to_string(),
    }
}

#[async_trait]
impl VcsProvider for GithubClient {
    fn installation_url(&self, state: &str) -> String {
        format!(
            "{}/apps/{}/installations/new?state={}",
            self.web_url, self.app_slug, state
        )
    }

    async fn installation_account(&self, installation_id: i64) -> Result<InstallationAccount, ProviderError> {
        let jwt = self.app_jwt()?;
        let body: InstallationBody = Self::send_json(self.request(
            reqwest::Method::GET,
            &format!("/app/installations/{installation_id}"),
            &jwt,
        ))
        .await?;

        Ok(InstallationAccount {
            login: body.account.login,
            account_type: body.account.kind,
        })
    }

    async fn mint_installation_token(&self, installation_id: i64) -> Result<InstallationToken, ProviderError> {
        let jwt = self.app_jwt()?;
        let token: InstallationToken = Self::send_json(self.request(
            reqwest::Method::POST,
            &format!("/app/installations/{installation_id}/access_tokens"),
            &jwt,
        ))
        .await?;

        tracing::debug!(installation_id, expires_at = %token.expires_at, "Minted installation token");
        Ok(token)
    }

    async fn list_repositories(&self, token: &str) -> Result<Vec<Repository>, ProviderError> {
        let mut repositories = Vec::new();
        for page in 1.. {
            let body: RepositoriesPage = Self::send_json(self.request(
                reqwest::Method::GET,
                &format!("/installation/repositories?per_page={PAGE_SIZE}&page={page}"),
                token,
            ))
            .await?;

            let fetched = body.repositories.len();
            repositories.extend(body.repositories);
            if fetched < PAGE_SIZE || repositories.len() >= body.total_count {
                break;
            }
        }
        Ok(repositories)
    }

    async fn list_branches(&self, token: &str, owner: &str, repo: &str) -> Result<Vec<Branch>, ProviderError> {
        let mut branches = Vec::new();
        for page in 1.. {
            let body: Vec<BranchBody> = Self::send_json(self.request(
                reqwest::Method::GET,
                &format!("/repos/{owner}/{repo}/branches?per_page={PAGE_SIZE}&page={page}"),
                token,
            ))
            .await?;

            let fetched = body.len();
            branches.extend(body.into_iter().map(|b| Branch {
                name: b.name,
                commit_sha: b.commit.sha,
                protected: b.protected,
            }));
            if fetched < PAGE_SIZE {
                break;
            }
        }
        Ok(branches)
    }
}
