use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

/// Repository entry as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    pub installation_id: i64,
    pub company_id: Uuid,
    pub account_login: String,
    pub account_type: String,
    pub repositories: Vec<Repository>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Installation {
    pub fn from_row(row: PgRow) -> Result<Self, sqlx::Error> {
        let repositories: serde_json::Value = row.try_get("repositories")?;
        Ok(Self {
            installation_id: row.try_get("installation_id")?,
            company_id: row.try_get("company_id")?,
            account_login: row.try_get("account_login")?,
            account_type: row.try_get("account_type")?,
            repositories: serde_json::from_value(repositories)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Apply an `installation_repositories` delta: added entries are appended
/// unless already present, removed entries are filtered out by id.
pub fn merge_repositories(
    existing: &[Repository],
    added: &[Repository],
    removed: &[Repository],
) -> Vec<Repository> {
    let mut merged: Vec<Repository> = existing.to_vec();
    for repo in added {
        if !merged.iter().any(|r| r.id == repo.id) {
            merged.push(repo.clone());
        }
    }
    merged.retain(|r| !removed.iter().any(|gone| gone.id == r.id));
    merged
}
