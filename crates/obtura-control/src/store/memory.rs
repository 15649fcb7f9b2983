use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CredentialStore, Result};
use crate::models::build::{BuildRequest, BuildStatus};
use crate::models::installation::{merge_repositories, Installation, Repository};
use crate::models::membership::RoleGrant;
use crate::models::project::Project;
use crate::models::session::SessionRecord;

#[derive(Clone, Debug)]
struct MemberRow {
    user_id: Uuid,
    company_id: Uuid,
    role_id: Uuid,
}

#[derive(Clone, Debug)]
struct RoleRow {
    company_id: Uuid,
    name: String,
    hierarchy_level: i32,
    permissions: Vec<(String, String)>,
}

#[derive(Clone, Debug)]
pub struct StoredBuild {
    pub request: BuildRequest,
    pub status: BuildStatus,
    pub error: Option<String>,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, SessionRecord>,
    // Insertion order doubles as the "first match" order for membership lookups.
    members: Vec<MemberRow>,
    roles: HashMap<Uuid, RoleRow>,
    owners: HashMap<Uuid, Uuid>,
    installations: HashMap<i64, Installation>,
    projects: HashMap<Uuid, Project>,
    builds: Vec<StoredBuild>,
}

/// In-process credential store for tests and local development.
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_session(&self, session: SessionRecord) {
        let mut tables = self.inner.write().await;
        tables.sessions.insert(session.token.clone(), session);
    }

    pub async fn session(&self, token: &str) -> Option<SessionRecord> {
        self.inner.read().await.sessions.get(token).cloned()
    }

    pub async fn insert_role(
        &self,
        role_id: Uuid,
        company_id: Uuid,
        name: &str,
        hierarchy_level: i32,
        permissions: &[(&str, &str)],
    ) {
        let mut tables = self.inner.write().await;
        tables.roles.insert(
            role_id,
            RoleRow {
                company_id,
                name: name.to_string(),
                hierarchy_level,
                permissions: permissions
                    .iter()
                    .map(|(r, a)| (r.to_string(), a.to_string()))
                    .collect(),
            },
        );
    }

    pub async fn set_role_permissions(&self, role_id: Uuid, permissions: &[(&str, &str)]) {
        let mut tables = self.inner.write().await;
        if let Some(role) = tables.roles.get_mut(&role_id) {
            role.permissions = permissions
                .iter()
                .map(|(r, a)| (r.to_string(), a.to_string()))
                .collect();
        }
    }

    pub async fn add_member(&self, user_id: Uuid, company_id: Uuid, role_id: Uuid) {
        let mut tables = self.inner.write().await;
        tables.members.push(MemberRow {
            user_id,
            company_id,
            role_id,
        });
    }

    pub async fn remove_member(&self, user_id: Uuid) {
        let mut tables = self.inner.write().await;
        tables.members.retain(|m| m.user_id != user_id);
    }

    pub async fn set_company_owner(&self, company_id: Uuid, owner_id: Uuid) {
        let mut tables = self.inner.write().await;
        tables.owners.insert(company_id, owner_id);
    }

    pub async fn insert_project(&self, project: Project) {
        let mut tables = self.inner.write().await;
        tables.projects.insert(project.id, project);
    }

    pub async fn builds(&self) -> Vec<StoredBuild> {
        self.inner.read().await.builds.clone()
    }
}

fn grant_for(tables: &Tables, user_id: Uuid, company_id: Uuid) -> Option<RoleGrant> {
    let member = tables
        .members
        .iter()
        .find(|m| m.user_id == user_id && m.company_id == company_id)?;
    let role = tables.roles.get(&member.role_id)?;
    Some(RoleGrant {
        role_id: member.role_id,
        role_name: role.name.clone(),
        hierarchy_level: role.hierarchy_level,
        permissions: role.permissions.clone(),
    })
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_session(&self, token: &str) -> Result<Option<SessionRecord>> {
        Ok(self.inner.read().await.sessions.get(token).cloned())
    }

    async fn touch_session(&self, token: &str, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.inner.write().await;
        if let Some(session) = tables.sessions.get_mut(token) {
            session.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn find_company_for_user(&self, user_id: Uuid) -> Result<Option<Uuid>> {
        let tables = self.inner.read().await;
        Ok(tables
            .members
            .iter()
            .find(|m| m.user_id == user_id)
            .map(|m| m.company_id))
    }

    async fn load_role_grant(&self, user_id: Uuid, company_id: Uuid) -> Result<Option<RoleGrant>> {
        let tables = self.inner.read().await;
        Ok(grant_for(&tables, user_id, company_id))
    }

    async fn find_role_level(&self, user_id: Uuid, company_id: Uuid) -> Result<Option<i32>> {
        let tables = self.inner.read().await;
        Ok(grant_for(&tables, user_id, company_id).map(|g| g.hierarchy_level))
    }

    async fn find_company_role_level(&self, role_id: Uuid, company_id: Uuid) -> Result<Option<i32>> {
        let tables = self.inner.read().await;
        Ok(tables
            .roles
            .get(&role_id)
            .filter(|r| r.company_id == company_id)
            .map(|r| r.hierarchy_level))
    }

    async fn find_company_owner(&self, company_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.inner.read().await.owners.get(&company_id).copied())
    }

    async fn update_member_role(&self, user_id: Uuid, company_id: Uuid, role_id: Uuid) -> Result<bool> {
        let mut tables = self.inner.write().await;
        let Some(member) = tables
            .members
            .iter_mut()
            .find(|m| m.user_id == user_id && m.company_id == company_id)
        else {
            return Ok(false);
        };
        member.role_id = role_id;
        Ok(true)
    }

    async fn upsert_installation(&self, installation: &Installation) -> Result<bool> {
        let mut tables = self.inner.write().await;
        match tables.installations.get_mut(&installation.installation_id) {
            Some(existing) if existing.company_id != installation.company_id => return Ok(false),
            Some(existing) => {
                existing.account_login = installation.account_login.clone();
                existing.account_type = installation.account_type.clone();
                existing.repositories = installation.repositories.clone();
                existing.updated_at = installation.updated_at;
            }
            None => {
                tables
                    .installations
                    .insert(installation.installation_id, installation.clone());
            }
        }
        Ok(true)
    }

    async fn find_installation(&self, installation_id: i64) -> Result<Option<Installation>> {
        Ok(self
            .inner
            .read()
            .await
            .installations
            .get(&installation_id)
            .cloned())
    }

    async fn list_installations(&self, company_id: Uuid) -> Result<Vec<Installation>> {
        let tables = self.inner.read().await;
        let mut found: Vec<Installation> = tables
            .installations
            .values()
            .filter(|i| i.company_id == company_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn delete_installation(&self, installation_id: i64) -> Result<bool> {
        let mut tables = self.inner.write().await;
        Ok(tables.installations.remove(&installation_id).is_some())
    }

    async fn merge_installation_repositories(
        &self,
        installation_id: i64,
        added: &[Repository],
        removed: &[Repository],
    ) -> Result<Option<Vec<Repository>>> {
        let mut tables = self.inner.write().await;
        let Some(installation) = tables.installations.get_mut(&installation_id) else {
            return Ok(None);
        };
        installation.repositories = merge_repositories(&installation.repositories, added, removed);
        installation.updated_at = Utc::now();
        Ok(Some(installation.repositories.clone()))
    }

    async fn find_project(&self, project_id: Uuid, company_id: Uuid) -> Result<Option<Project>> {
        let tables = self.inner.read().await;
        Ok(tables
            .projects
            .get(&project_id)
            .filter(|p| p.company_id == company_id)
            .cloned())
    }

    async fn list_projects_for_installation(&self, installation_id: i64) -> Result<Vec<Project>> {
        let tables = self.inner.read().await;
        Ok(tables
            .projects
            .values()
            .filter(|p| p.installation_id == Some(installation_id))
            .cloned()
            .collect())
    }

    async fn insert_pending_build(&self, build: &BuildRequest) -> Result<()> {
        let mut tables = self.inner.write().await;
        tables.builds.push(StoredBuild {
            request: build.clone(),
            status: BuildStatus::Pending,
            error: None,
        });
        Ok(())
    }

    async fn mark_build_failed(&self, build_id: Uuid, reason: &str) -> Result<()> {
        let mut tables = self.inner.write().await;
        if let Some(build) = tables
            .builds
            .iter_mut()
            .find(|b| b.request.build_id == build_id)
        {
            build.status = BuildStatus::Failed;
            build.error = Some(reason.to_string());
        }
        Ok(())
    }
}
