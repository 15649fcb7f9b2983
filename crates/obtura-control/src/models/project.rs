use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployEnvironment {
    Production,
    Staging,
    Development,
}

impl DeployEnvironment {
    /// Precedence used when one branch backs several environments.
    pub const ALL: [DeployEnvironment; 3] = [Self::Production, Self::Staging, Self::Development];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Development => "development",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub repository_url: Option<String>,
    pub installation_id: Option<i64>,
    pub production_branch: Option<String>,
    pub staging_branch: Option<String>,
    pub development_branch: Option<String>,
    pub auto_deploy_production: bool,
    pub auto_deploy_staging: bool,
    pub auto_deploy_development: bool,
}

impl Project {
    pub fn from_row(row: PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            name: row.try_get("name")?,
            repository_url: row.try_get("repository_url")?,
            installation_id: row.try_get("installation_id")?,
            production_branch: row.try_get("production_branch")?,
            staging_branch: row.try_get("staging_branch")?,
            development_branch: row.try_get("development_branch")?,
            auto_deploy_production: row.try_get("auto_deploy_production")?,
            auto_deploy_staging: row.try_get("auto_deploy_staging")?,
            auto_deploy_development: row.try_get("auto_deploy_development")?,
        })
    }

    pub fn branch_for(&self, env: DeployEnvironment) -> Option<&str> {
        match env {
            DeployEnvironment::Production => self.production_branch.as_deref(),
            DeployEnvironment::Staging => self.staging_branch.as_deref(),
            DeployEnvironment::Development => self.development_branch.as_deref(),
        }
    }

    pub fn auto_deploy(&self, env: DeployEnvironment) -> bool {
        match env {
            DeployEnvironment::Production => self.auto_deploy_production,
            DeployEnvironment::Staging => self.auto_deploy_staging,
            DeployEnvironment::Development => self.auto_deploy_development,
        }
    }

    pub fn repository_matches(&self, url: &str) -> bool {
        self.repository_url
            .as_deref()
            .is_some_and(|own| normalize_repository_url(own) == normalize_repository_url(url))
    }
}

/// Canonical form for comparing repository URLs: lowercase, no trailing `/`
/// and no `.git` suffix.
pub fn normalize_repository_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    trimmed.to_ascii_lowercase()
}

/// Extract `(owner, repo)` from an https or scp-style git URL.
pub fn parse_owner_repo(url: &str) -> Option<(String, String)> {
    let normalized = url.trim().trim_end_matches('/');
    let normalized = normalized.strip_suffix(".git").unwrap_or(normalized);
    let path = match normalized.split_once("://") {
        Some((_, rest)) => rest.split_once('/')?.1,
        None => normalized.split_once(':')?.1,
    };
    let mut parts = path.rsplitn(3, '/');
    let repo = parts.next().filter(|s| !s.is_empty())?;
    let owner = parts.next().filter(|s| !s.is_empty())?;
    Some((owner.to_string(), repo.to_string()))
}
