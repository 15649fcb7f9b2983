//! Identity and authorization decisions for privileged requests.

use std::sync::Arc;

use uuid::Uuid;

use super::cache::PermissionCache;
use super::AuthError;
use crate::clock::Clock;
use crate::models::membership::{PermissionSet, RoleInfo, TenantMembership};
use crate::models::session::Identity;
use crate::store::CredentialStore;

#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn CredentialStore>,
    cache: PermissionCache,
    clock: Arc<dyn Clock>,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        let cache = PermissionCache::with_default_ttl(clock.clone());
        Self::with_cache(store, cache, clock)
    }

    pub fn with_cache(
        store: Arc<dyn CredentialStore>,
        cache: PermissionCache,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, cache, clock }
    }

    pub fn cache(&self) -> &PermissionCache {
        &self.cache
    }

    /// Resolve a bearer session token to the calling user.
    pub async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Unauthenticated);
        }

        let session = self
            .store
            .find_session(token)
            .await?
            .ok_or(AuthError::Unauthenticated)?;

        let now = self.clock.now();
        if session.is_expired(now) {
            return Err(AuthError::Unauthenticated);
        }
        if !session.user_is_active() {
            return Err(AuthError::AccountInactive);
        }

        if let Err(e) = self.store.touch_session(token, now).await {
            tracing::warn!(user_id = %session.user_id, error = %e, "Failed to update session last-used time");
        }

        Ok(Identity {
            user_id: session.user_id,
            session_expires_at: session.expires_at,
        })
    }

    /// Resolve the caller's company and permission set, serving the
    /// permission set from cache when fresh.
    pub async fn resolve_tenant_context(&self, identity: &Identity) -> Result<TenantMembership, AuthError> {
        self.resolve(identity, false).await
    }

    /// Like [`Self::resolve_tenant_context`] but always re-derives from the
    /// store, so role details are populated.
    pub async fn resolve_tenant_context_fresh(
        &self,
        identity: &Identity,
    ) -> Result<TenantMembership, AuthError> {
        self.resolve(identity, true).await
    }

    async fn resolve(&self, identity: &Identity, bypass_cache: bool) -> Result<TenantMembership, AuthError> {
        let user_id = identity.user_id;
        let company_id = self
            .store
            .find_company_for_user(user_id)
            .await?
            .ok_or(AuthError::NoTenantContext)?;

        if !bypass_cache {
            if let Some(permissions) = self.cache.get(user_id, company_id) {
                return Ok(TenantMembership {
                    user_id,
                    company_id,
                    role: None,
                    permissions,
                });
            }
        }

        let grant = self
            .store
            .load_role_grant(user_id, company_id)
            .await?
            .ok_or(AuthError::NoTenantContext)?;

        let permissions = Arc::new(PermissionSet::from_pairs(grant.permissions));
        self.cache.insert(user_id, company_id, permissions.clone());
        tracing::debug!(
            user_id = %user_id,
            company_id = %company_id,
            permissions = permissions.len(),
            "Resolved tenant permissions"
        );

        Ok(TenantMembership {
            user_id,
            company_id,
            role: Some(RoleInfo {
                id: grant.role_id,
                name: grant.role_name,
                hierarchy_level: grant.hierarchy_level,
            }),
            permissions,
        })
    }

    /// Check that `actor` may manage `target` within `company_id`: the actor's
    /// hierarchy level must be strictly lower (more senior) than the target's.
    pub async fn can_manage_user(
        &self,
        actor_id: Uuid,
        target_id: Uuid,
        company_id: Uuid,
    ) -> Result<(), AuthError> {
        let target_level = self
            .store
            .find_role_level(target_id, company_id)
            .await?
            .ok_or(AuthError::TargetNotFound)?;
        let actor_level = self
            .store
            .find_role_level(actor_id, company_id)
            .await?
            .ok_or(AuthError::NoTenantContext)?;

        if hierarchy_permits(actor_level, target_level) {
            Ok(())
        } else {
            Err(AuthError::InsufficientPrivilege)
        }
    }

    /// Check that `actor` may hand out `role_id`: the role must be defined for
    /// `company_id` and sit strictly below the actor's own level.
    pub async fn can_assign_role(
        &self,
        actor_id: Uuid,
        role_id: Uuid,
        company_id: Uuid,
    ) -> Result<(), AuthError> {
        let Some(role_level) = self
            .store
            .find_company_role_level(role_id, company_id)
            .await?
        else {
            tracing::warn!(actor = %actor_id, role_id = %role_id, tenant_id = %company_id, "Role is not defined for tenant");
            return Err(AuthError::InsufficientPrivilege);
        };
        let actor_level = self
            .store
            .find_role_level(actor_id, company_id)
            .await?
            .ok_or(AuthError::NoTenantContext)?;

        if hierarchy_permits(actor_level, role_level) {
            Ok(())
        } else {
            Err(AuthError::InsufficientPrivilege)
        }
    }

    pub async fn is_company_owner(&self, company_id: Uuid, user_id: Uuid) -> Result<bool, AuthError> {
        let owner = self
            .store
            .find_company_owner(company_id)
            .await?
            .ok_or(AuthError::NoTenantContext)?;
        Ok(owner == user_id)
    }

    /// Must be called whenever a membership's role or a role's permissions change.
    pub fn invalidate(&self, user_id: Option<Uuid>, company_id: Option<Uuid>) {
        self.cache.invalidate(user_id, company_id);
    }
}

/// Lower level means more senior; equal levels cannot manage each other.
pub fn hierarchy_permits(actor_level: i32, target_level: i32) -> bool {
    actor_level < target_level
}

/// Cache-only authorization check. Never performs I/O.
pub fn require_permission(
    membership: &TenantMembership,
    resource: &str,
    action: &str,
) -> Result<(), AuthError> {
    if membership.permissions.allows(resource, action) {
        Ok(())
    } else {
        Err(AuthError::Forbidden {
            resource: resource.to_string(),
            action: action.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::models::session::SessionRecord;
    use crate::store::MemoryCredentialStore;

    struct Fixture {
        store: MemoryCredentialStore,
        clock: Arc<ManualClock>,
        resolver: PermissionResolver,
        user: Uuid,
        company: Uuid,
        role: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = MemoryCredentialStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let resolver = PermissionResolver::new(Arc::new(store.clone()), clock.clone());
        let (user, company, role) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        store
            .insert_role(role, company, "developer", 3, &[("project", "create"), ("build", "create")])
            .await;
        store.add_member(user, company, role).await;
        store.insert_session(session("tok123", user, "active", clock.now())).await;

        Fixture {
            store,
            clock,
            resolver,
            user,
            company,
            role,
        }
    }

    fn session(token: &str, user_id: Uuid, status: &str, now: chrono::DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            token: token.to_string(),
            user_id,
            user_status: status.to_string(),
            created_at: now,
            expires_at: now + Duration::hours(1),
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn authenticate_rejects_missing_unknown_and_expired() {
        let f = fixture().await;
        assert!(matches!(f.resolver.authenticate("").await, Err(AuthError::Unauthenticated)));
        assert!(matches!(f.resolver.authenticate("nope").await, Err(AuthError::Unauthenticated)));

        f.clock.advance(Duration::hours(1));
        assert!(matches!(f.resolver.authenticate("tok123").await, Err(AuthError::Unauthenticated)));
    }

    #[tokio::test]
    async fn authenticate_rejects_inactive_account() {
        let f = fixture().await;
        let suspended = Uuid::new_v4();
        f.store
            .insert_session(session("tok-suspended", suspended, "suspended", f.clock.now()))
            .await;

        let result = f.resolver.authenticate("tok-suspended").await;
        assert!(matches!(result, Err(AuthError::AccountInactive)));
    }

    #[tokio::test]
    async fn authenticate_touches_last_used() {
        let f = fixture().await;
        let identity = f.resolver.authenticate("tok123").await.unwrap();
        assert_eq!(identity.user_id, f.user);

        let stored = f.store.session("tok123").await.unwrap();
        assert_eq!(stored.last_used_at, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn cache_hit_withholds_role_details() {
        let f = fixture().await;
        let identity = f.resolver.authenticate("tok123").await.unwrap();

        let first = f.resolver.resolve_tenant_context(&identity).await.unwrap();
        assert_eq!(first.company_id, f.company);
        assert_eq!(first.role.as_ref().map(|r| r.hierarchy_level), Some(3));

        let second = f.resolver.resolve_tenant_context(&identity).await.unwrap();
        assert!(second.role.is_none());
        assert!(second.permissions.allows("project", "create"));

        let fresh = f.resolver.resolve_tenant_context_fresh(&identity).await.unwrap();
        assert_eq!(fresh.role.map(|r| r.name), Some("developer".to_string()));
    }

    #[tokio::test]
    async fn invalidate_forces_rederivation_before_ttl() {
        let f = fixture().await;
        let identity = f.resolver.authenticate("tok123").await.unwrap();
        let before = f.resolver.resolve_tenant_context(&identity).await.unwrap();
        assert!(before.permissions.allows("project", "create"));

        f.store.set_role_permissions(f.role, &[("project", "read")]).await;

        // Still cached: the role change is not visible yet.
        let cached = f.resolver.resolve_tenant_context(&identity).await.unwrap();
        assert!(cached.permissions.allows("project", "create"));

        f.resolver.invalidate(Some(f.user), Some(f.company));
        let after = f.resolver.resolve_tenant_context(&identity).await.unwrap();
        assert!(!after.permissions.allows("project", "create"));
        assert!(after.permissions.allows("project", "read"));
    }

    #[tokio::test]
    async fn no_membership_is_no_tenant_context() {
        let f = fixture().await;
        let loner = Identity {
            user_id: Uuid::new_v4(),
            session_expires_at: f.clock.now(),
        };
        let result = f.resolver.resolve_tenant_context(&loner).await;
        assert!(matches!(result, Err(AuthError::NoTenantContext)));
    }

    #[tokio::test]
    async fn require_permission_denies_with_pair() {
        let f = fixture().await;
        let identity = f.resolver.authenticate("tok123").await.unwrap();
        let membership = f.resolver.resolve_tenant_context(&identity).await.unwrap();

        assert!(require_permission(&membership, "project", "create").is_ok());
        match require_permission(&membership, "project", "delete") {
            Err(AuthError::Forbidden { resource, action }) => {
                assert_eq!(resource, "project");
                assert_eq!(action, "delete");
            }
            other => panic!("expected forbidden, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hierarchy_is_strict_over_level_lattice() {
        let store = MemoryCredentialStore::new();
        let resolver = PermissionResolver::new(Arc::new(store.clone()), Arc::new(ManualClock::default()));
        let company = Uuid::new_v4();

        let mut users = Vec::new();
        for level in 0..=5 {
            let role = Uuid::new_v4();
            let user = Uuid::new_v4();
            store.insert_role(role, company, &format!("level-{level}"), level, &[]).await;
            store.add_member(user, company, role).await;
            users.push((level, user));
        }

        for &(a, actor) in &users {
            for &(t, target) in &users {
                let result = resolver.can_manage_user(actor, target, company).await;
                if a < t {
                    assert!(result.is_ok(), "level {a} should manage level {t}");
                } else {
                    assert!(
                        matches!(result, Err(AuthError::InsufficientPrivilege)),
                        "level {a} must not manage level {t}"
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn manage_unknown_target_is_not_found() {
        let f = fixture().await;
        let result = f.resolver.can_manage_user(f.user, Uuid::new_v4(), f.company).await;
        assert!(matches!(result, Err(AuthError::TargetNotFound)));
    }

    #[tokio::test]
    async fn owner_check_compares_recorded_owner() {
        let f = fixture().await;
        f.store.set_company_owner(f.company, f.user).await;

        assert!(f.resolver.is_company_owner(f.company, f.user).await.unwrap());
        assert!(!f.resolver.is_company_owner(f.company, Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn assignable_roles_sit_below_the_actor_within_the_company() {
        let f = fixture().await;
        let mut roles = Vec::new();
        for level in [0, 3, 4] {
            let role = Uuid::new_v4();
            f.store.insert_role(role, f.company, &format!("level-{level}"), level, &[]).await;
            roles.push(role);
        }

        // The fixture user sits at level 3.
        assert!(matches!(
            f.resolver.can_assign_role(f.user, roles[0], f.company).await,
            Err(AuthError::InsufficientPrivilege)
        ));
        assert!(matches!(
            f.resolver.can_assign_role(f.user, roles[1], f.company).await,
            Err(AuthError::InsufficientPrivilege)
        ));
        assert!(f.resolver.can_assign_role(f.user, roles[2], f.company).await.is_ok());

        let foreign = Uuid::new_v4();
        f.store.insert_role(foreign, Uuid::new_v4(), "guest", 9, &[]).await;
        assert!(matches!(
            f.resolver.can_assign_role(f.user, foreign, f.company).await,
            Err(AuthError::InsufficientPrivilege)
        ));
        assert!(matches!(
            f.resolver.can_assign_role(f.user, Uuid::new_v4(), f.company).await,
            Err(AuthError::InsufficientPrivilege)
        ));
    }

    #[tokio::test]
    async fn first_membership_wins_for_multi_company_user() {
        // Lookup order is unspecified in production; the in-memory store is
        // insertion-ordered so the chosen company is deterministic here.
        let f = fixture().await;
        let other_company = Uuid::new_v4();
        f.store.add_member(f.user, other_company, f.role).await;

        let identity = f.resolver.authenticate("tok123").await.unwrap();
        let membership = f.resolver.resolve_tenant_context(&identity).await.unwrap();
        assert_eq!(membership.company_id, f.company);
    }
}
