use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

/// Role assignment plus the permissions joined from its role definition.
#[derive(Debug, Clone)]
pub struct RoleGrant {
    pub role_id: Uuid,
    pub role_name: String,
    pub hierarchy_level: i32,
    /// `(resource, action)` pairs.
    pub permissions: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleInfo {
    pub id: Uuid,
    pub name: String,
    pub hierarchy_level: i32,
}

/// Materialized `resource:action` grants for one user within one company.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    entries: HashSet<String>,
}

impl PermissionSet {
    pub fn from_pairs<R, A>(pairs: impl IntoIterator<Item = (R, A)>) -> Self
    where
        R: AsRef<str>,
        A: AsRef<str>,
    {
        let entries = pairs
            .into_iter()
            .map(|(resource, action)| permission_key(resource.as_ref(), action.as_ref()))
            .collect();
        Self { entries }
    }

    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.entries.contains(&permission_key(resource, action))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sorted: Vec<&str> = self.iter().collect();
        sorted.sort_unstable();
        write!(f, "{}", sorted.join(","))
    }
}

pub fn permission_key(resource: &str, action: &str) -> String {
    format!("{resource}:{action}")
}

/// The caller's membership in the company resolved for this request.
///
/// `role` is `None` when the permission set was served from cache; callers
/// that need role details must resolve with a cache bypass.
#[derive(Debug, Clone)]
pub struct TenantMembership {
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub role: Option<RoleInfo>,
    pub permissions: Arc<PermissionSet>,
}
