//! Key-based access to the relational credential store.

mod memory;
mod postgres;

pub use memory::{MemoryCredentialStore, StoredBuild};
pub use postgres::PgCredentialStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::build::BuildRequest;
use crate::models::installation::{Installation, Repository};
use crate::models::membership::RoleGrant;
use crate::models::project::Project;
use crate::models::session::SessionRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_session(&self, token: &str) -> Result<Option<SessionRecord>>;
    async fn touch_session(&self, token: &str, at: DateTime<Utc>) -> Result<()>;

    /// First membership row for the user; ordering is unspecified when the
    /// user belongs to several companies.
    async fn find_company_for_user(&self, user_id: Uuid) -> Result<Option<Uuid>>;
    async fn load_role_grant(&self, user_id: Uuid, company_id: Uuid) -> Result<Option<RoleGrant>>;
    async fn find_role_level(&self, user_id: Uuid, company_id: Uuid) -> Result<Option<i32>>;
    /// Hierarchy level of `role_id` if the role is defined for `company_id`.
    async fn find_company_role_level(&self, role_id: Uuid, company_id: Uuid) -> Result<Option<i32>>;
    async fn find_company_owner(&self, company_id: Uuid) -> Result<Option<Uuid>>;
    async fn update_member_role(&self, user_id: Uuid, company_id: Uuid, role_id: Uuid) -> Result<bool>;

    /// Insert or update keyed by installation id. Returns `false` without
    /// writing when the installation is already linked to another company.
    async fn upsert_installation(&self, installation: &Installation) -> Result<bool>;
    async fn find_installation(&self, installation_id: i64) -> Result<Option<Installation>>;
    async fn list_installations(&self, company_id: Uuid) -> Result<Vec<Installation>>;
    async fn delete_installation(&self, installation_id: i64) -> Result<bool>;
    /// Apply a repository delta atomically. `None` when the installation is
    /// unknown.
    async fn merge_installation_repositories(
        &self,
        installation_id: i64,
        added: &[Repository],
        removed: &[Repository],
    ) -> Result<Option<Vec<Repository>>>;

    async fn find_project(&self, project_id: Uuid, company_id: Uuid) -> Result<Option<Project>>;
    async fn list_projects_for_installation(&self, installation_id: i64) -> Result<Vec<Project>>;

    async fn insert_pending_build(&self, build: &BuildRequest) -> Result<()>;
    async fn mark_build_failed(&self, build_id: Uuid, reason: &str) -> Result<()>;
}
