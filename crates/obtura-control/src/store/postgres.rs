use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{CredentialStore, Result, StoreError};
use crate::db::PgPool;
use crate::models::build::{BuildRequest, BuildStatus};
use crate::models::installation::{merge_repositories, Installation, Repository};
use crate::models::membership::RoleGrant;
use crate::models::project::Project;
use crate::models::session::SessionRecord;

const PROJECT_COLUMNS: &str = r#"id, company_id, name, repository_url, installation_id,
       production_branch, staging_branch, development_branch,
       auto_deploy_production, auto_deploy_staging, auto_deploy_development"#;

/// PostgreSQL-backed credential store.
#[derive(Clone)]
pub struct PgCredentialStore {
    db: PgPool,
}

impl PgCredentialStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db
    }
}

fn repositories_json(repositories: &[Repository]) -> Result<serde_json::Value> {
    serde_json::to_value(repositories).map_err(|e| StoreError::Corrupt(e.to_string()))
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_session(&self, token: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            r#"SELECT s.token, s.user_id, s.created_at, s.expires_at, s.last_used_at,
                      u.status AS user_status
               FROM sessions s
               JOIN users u ON u.id = s.user_id
               WHERE s.token = $1"#,
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await?;

        row.map(SessionRecord::from_row).transpose().map_err(Into::into)
    }

    async fn touch_session(&self, token: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_used_at = $2 WHERE token = $1")
            .bind(token)
            .bind(at)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn find_company_for_user(&self, user_id: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query("SELECT company_id FROM company_users WHERE user_id = $1 LIMIT 1")
            .bind(user_id)
            .fetch_optional(&self.db)
            .await?;

        row.map(|r| r.try_get("company_id"))
            .transpose()
            .map_err(Into::into)
    }

    async fn load_role_grant(&self, user_id: Uuid, company_id: Uuid) -> Result<Option<RoleGrant>> {
        let Some(role) = sqlx::query(
            r#"SELECT r.id, r.name, r.hierarchy_level
               FROM company_users cu
               JOIN roles r ON r.id = cu.role_id
               WHERE cu.user_id = $1 AND cu.company_id = $2
               LIMIT 1"#,
        )
        .bind(user_id)
        .bind(company_id)
        .fetch_optional(&self.db)
        .await?
        else {
            return Ok(None);
        };

        let role_id: Uuid = role.try_get("id")?;
        let rows = sqlx::query(
            r#"SELECT p.resource, p.action
               FROM role_permissions rp
               JOIN permissions p ON p.id = rp.permission_id
               WHERE rp.role_id = $1"#,
        )
        .bind(role_id)
        .fetch_all(&self.db)
        .await?;

        let permissions = rows
            .into_iter()
            .map(|r| -> std::result::Result<(String, String), sqlx::Error> {
                Ok((r.try_get("resource")?, r.try_get("action")?))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(RoleGrant {
            role_id,
            role_name: role.try_get("name")?,
            hierarchy_level: role.try_get("hierarchy_level")?,
            permissions,
        }))
    }

    async fn find_role_level(&self, user_id: Uuid, company_id: Uuid) -> Result<Option<i32>> {
        let row = sqlx::query(
            r#"SELECT r.hierarchy_level
               FROM company_users cu
               JOIN roles r ON r.id = cu.role_id
               WHERE cu.user_id = $1 AND cu.company_id = $2
               LIMIT 1"#,
        )
        .bind(user_id)
        .bind(company_id)
        .fetch_optional(&self.db)
        .await?;

        row.map(|r| r.try_get("hierarchy_level"))
            .transpose()
            .map_err(Into::into)
    }

    async fn find_company_role_level(&self, role_id: Uuid, company_id: Uuid) -> Result<Option<i32>> {
        let row = sqlx::query("SELECT hierarchy_level FROM roles WHERE id = $1 AND company_id = $2")
            .bind(role_id)
            .bind(company_id)
            .fetch_optional(&self.db)
            .await?;

        row.map(|r| r.try_get("hierarchy_level"))
            .transpose()
            .map_err(Into::into)
    }

    async fn find_company_owner(&self, company_id: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query("SELECT owner_id FROM companies WHERE id = $1")
            .bind(company_id)
            .fetch_optional(&self.db)
            .await?;

        row.map(|r| r.try_get("owner_id"))
            .transpose()
            .map_err(Into::into)
    }

    async fn update_member_role(&self, user_id: Uuid, company_id: Uuid, role_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE company_users SET role_id = $3 WHERE user_id = $1 AND company_id = $2",
        )
        .bind(user_id)
        .bind(company_id)
        .bind(role_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_installation(&self, installation: &Installation) -> Result<bool> {
        let result = sqlx::query(
            r#"INSERT INTO github_installations
                   (installation_id, company_id, account_login, account_type, repositories, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (installation_id) DO UPDATE
               SET account_login = EXCLUDED.account_login,
                   account_type = EXCLUDED.account_type,
                   repositories = EXCLUDED.repositories,
                   updated_at = EXCLUDED.updated_at
               WHERE github_installations.company_id = EXCLUDED.company_id"#,
        )
        .bind(installation.installation_id)
        .bind(installation.company_id)
        .bind(&installation.account_login)
        .bind(&installation.account_type)
        .bind(repositories_json(&installation.repositories)?)
        .bind(installation.created_at)
        .bind(installation.updated_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_installation(&self, installation_id: i64) -> Result<Option<Installation>> {
        let row = sqlx::query("SELECT * FROM github_installations WHERE installation_id = $1")
            .bind(installation_id)
            .fetch_optional(&self.db)
            .await?;

        row.map(Installation::from_row).transpose().map_err(Into::into)
    }

    async fn list_installations(&self, company_id: Uuid) -> Result<Vec<Installation>> {
        let rows = sqlx::query(
            "SELECT * FROM github_installations WHERE company_id = $1 ORDER BY created_at DESC",
        )
        .bind(company_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(Installation::from_row)
            .collect::<std::result::Result<_, _>>()
            .map_err(Into::into)
    }

    async fn delete_installation(&self, installation_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM github_installations WHERE installation_id = $1")
            .bind(installation_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn merge_installation_repositories(
        &self,
        installation_id: i64,
        added: &[Repository],
        removed: &[Repository],
    ) -> Result<Option<Vec<Repository>>> {
        let mut tx = self.db.begin().await?;

        let Some(row) = sqlx::query(
            "SELECT repositories FROM github_installations WHERE installation_id = $1 FOR UPDATE",
        )
        .bind(installation_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        let stored: serde_json::Value = row.try_get("repositories")?;
        let existing: Vec<Repository> =
            serde_json::from_value(stored).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let merged = merge_repositories(&existing, added, removed);

        sqlx::query(
            r#"UPDATE github_installations
               SET repositories = $2, updated_at = now()
               WHERE installation_id = $1"#,
        )
        .bind(installation_id)
        .bind(repositories_json(&merged)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(merged))
    }

    async fn find_project(&self, project_id: Uuid, company_id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1 AND company_id = $2"
        ))
        .bind(project_id)
        .bind(company_id)
        .fetch_optional(&self.db)
        .await?;

        row.map(Project::from_row).transpose().map_err(Into::into)
    }

    async fn list_projects_for_installation(&self, installation_id: i64) -> Result<Vec<Project>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE installation_id = $1"
        ))
        .bind(installation_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(Project::from_row)
            .collect::<std::result::Result<_, _>>()
            .map_err(Into::into)
    }

    async fn insert_pending_build(&self, build: &BuildRequest) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO builds (id, project_id, commit_hash, branch, status, trigger, requested_by, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(build.build_id)
        .bind(build.project_id)
        .bind(&build.commit_hash)
        .bind(&build.branch)
        .bind(BuildStatus::Pending.as_str())
        .bind(build.trigger.as_str())
        .bind(build.requested_by)
        .bind(build.enqueued_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_build_failed(&self, build_id: Uuid, reason: &str) -> Result<()> {
        sqlx::query("UPDATE builds SET status = $2, error_message = $3 WHERE id = $1")
            .bind(build_id)
            .bind(BuildStatus::Failed.as_str())
            .bind(reason)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
