//! Read-through identity cache.
//!
//! [`IdentityCache`] fronts an [`IdentityStore`] with one
//! [`RevisionedCacheStore`] per entity kind plus the alternative lookup
//! cache. Reads go to the local stores first and fall through to the live
//! model on a miss. Writers call the `on_*` hooks after changing the live
//! model; each hook assigns a new revision, applies it locally and publishes
//! it to the other nodes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use warden_core::{
    ClientModel, EntityId, EntityKind, IdentityProviderModel, Revision, RoleModel, WardenResult,
};

use super::config::CacheConfig;
use super::entities::{
    CachedClient, CachedGroup, CachedIdentityProvider, CachedRole, CachedUser, CachedUserSession,
};
use super::invalidation::{InvalidationAction, InvalidationBus, InvalidationMessage};
use super::lookup::AlternativeLookupCache;
use super::resolve;
use super::store::{PutOutcome, RevisionedCacheStore};
use super::traits::{CacheStats, Revisioned};
use crate::IdentityStore;

/// Cache of identity-store entities for one node.
pub struct IdentityCache {
    store: Arc<dyn IdentityStore>,
    bus: Option<Arc<dyn InvalidationBus>>,
    config: CacheConfig,
    roles: RevisionedCacheStore<CachedRole>,
    clients: RevisionedCacheStore<CachedClient>,
    groups: RevisionedCacheStore<CachedGroup>,
    users: RevisionedCacheStore<CachedUser>,
    identity_providers: RevisionedCacheStore<CachedIdentityProvider>,
    user_sessions: RevisionedCacheStore<CachedUserSession>,
    lookups: AlternativeLookupCache,
}

/// Serve `id` from `cache`, loading and caching it on a miss.
///
/// The known revision is read before the load, so a concurrent invalidation
/// makes the `put` a stale discard rather than caching an outdated snapshot.
fn read_through<E, M, L, B>(
    cache: &RevisionedCacheStore<E>,
    id: &str,
    load: L,
    build: B,
) -> WardenResult<Option<Arc<E>>>
where
    E: Revisioned,
    L: FnOnce() -> WardenResult<Option<M>>,
    B: FnOnce(&M, Revision) -> E,
{
    if let Some(hit) = cache.get(id) {
        return Ok(Some(hit));
    }
    let revision = cache.current_revision(id);
    let model = match load()? {
        Some(model) => model,
        None => return Ok(None),
    };
    let entry = Arc::new(build(&model, revision));
    if cache.put(Arc::clone(&entry)) == PutOutcome::StaleDiscarded {
        tracing::trace!(cache = cache.name(), id = %id, revision, "Serving uncached snapshot");
    }
    Ok(Some(entry))
}

impl IdentityCache {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            bus: None,
            roles: RevisionedCacheStore::new("roles", &config),
            clients: RevisionedCacheStore::new("clients", &config),
            groups: RevisionedCacheStore::new("groups", &config),
            users: RevisionedCacheStore::new("users", &config),
            identity_providers: RevisionedCacheStore::new("identity_providers", &config),
            user_sessions: RevisionedCacheStore::new("user_sessions", &config),
            lookups: AlternativeLookupCache::new(),
            config,
        }
    }

    /// Publish local changes on `bus`.
    pub fn with_bus(mut self, bus: Arc<dyn InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The live store this cache reads through.
    pub fn store(&self) -> &dyn IdentityStore {
        self.store.as_ref()
    }

    // === Read-through getters ===

    pub fn role(&self, id: &str) -> WardenResult<Option<Arc<CachedRole>>> {
        read_through(&self.roles, id, || self.store.role_by_id(id), CachedRole::from_model)
    }

    pub fn client(&self, id: &str) -> WardenResult<Option<Arc<CachedClient>>> {
        read_through(&self.clients, id, || self.store.client_by_id(id), CachedClient::from_model)
    }

    pub fn group(&self, id: &str) -> WardenResult<Option<Arc<CachedGroup>>> {
        read_through(&self.groups, id, || self.store.group_by_id(id), CachedGroup::from_model)
    }

    pub fn user(&self, id: &str) -> WardenResult<Option<Arc<CachedUser>>> {
        read_through(&self.users, id, || self.store.user_by_id(id), CachedUser::from_model)
    }

    pub fn identity_provider(&self, id: &str) -> WardenResult<Option<Arc<CachedIdentityProvider>>> {
        read_through(
            &self.identity_providers,
            id,
            || self.store.identity_provider_by_id(id),
            CachedIdentityProvider::from_model,
        )
    }

    pub fn user_session(&self, id: &str) -> WardenResult<Option<Arc<CachedUserSession>>> {
        read_through(
            &self.user_sessions,
            id,
            || self.store.user_session_by_id(id),
            CachedUserSession::from_model,
        )
    }

    /// Direct composites of `role_id`, loaded lazily on the cached role.
    pub fn role_composites(&self, role_id: &str) -> WardenResult<BTreeSet<EntityId>> {
        match self.role(role_id)? {
            Some(role) => Ok(role.composites(self.store.as_ref())?.clone()),
            None => Ok(BTreeSet::new()),
        }
    }

    /// `role_id` plus every role reachable through composites.
    ///
    /// Cycles in the composite graph are tolerated.
    pub fn expand_composites(&self, role_id: &str) -> WardenResult<BTreeSet<EntityId>> {
        let mut expanded = BTreeSet::new();
        let mut queue = VecDeque::from([role_id.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !expanded.insert(id.clone()) {
                continue;
            }
            if let Some(role) = self.role(&id)? {
                for child in role.composites(self.store.as_ref())? {
                    if !expanded.contains(child) {
                        queue.push_back(child.clone());
                    }
                }
            }
        }
        Ok(expanded)
    }

    /// Returns true if the user holds `role_id` directly, through a group or
    /// a parent group, or through a composite of any of those.
    pub fn user_has_role(&self, user_id: &str, role_id: &str) -> WardenResult<bool> {
        let user = match self.user(user_id)? {
            Some(user) => user,
            None => return Ok(false),
        };
        let store = self.store.as_ref();

        let mut mapped: BTreeSet<EntityId> = user.role_mappings(store)?.clone();
        let mut visited = BTreeSet::new();
        let mut groups: VecDeque<EntityId> = user.group_ids(store)?.iter().cloned().collect();
        while let Some(group_id) = groups.pop_front() {
            if !visited.insert(group_id.clone()) {
                continue;
            }
            if let Some(group) = self.group(&group_id)? {
                mapped.extend(group.role_mappings(store)?.iter().cloned());
                if let Some(parent) = &group.parent_id {
                    groups.push_back(parent.clone());
                }
            }
        }

        for mapped_role in &mapped {
            if self.expand_composites(mapped_role)?.contains(role_id) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // === Alternative lookups ===

    pub fn role_from_string(&self, realm_id: &str, role_name: &str) -> WardenResult<Option<RoleModel>> {
        resolve::lookup_role_from_string(
            &self.lookups,
            self.store.as_ref(),
            realm_id,
            role_name,
            self.config.max_client_lookups,
        )
    }

    pub fn identity_provider_from_issuer(
        &self,
        realm_id: &str,
        issuer: &str,
    ) -> WardenResult<Option<IdentityProviderModel>> {
        resolve::lookup_identity_provider_from_issuer(
            &self.lookups,
            self.store.as_ref(),
            realm_id,
            issuer,
        )
    }

    pub fn client_from_attributes(
        &self,
        realm_id: &str,
        attributes: &BTreeMap<String, String>,
    ) -> WardenResult<Option<ClientModel>> {
        resolve::lookup_client_from_attributes(
            &self.lookups,
            self.store.as_ref(),
            realm_id,
            attributes,
        )
    }

    pub fn lookups(&self) -> &AlternativeLookupCache {
        &self.lookups
    }

    // === Mutation hooks ===
    //
    // Each hook draws its revision from the store and fails only if the store
    // cannot allocate one.

    pub fn on_role_updated(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::Role, id, InvalidationAction::Evict)
    }

    /// Evicts the role and every cached role, group and user whose loaded
    /// sub-fields reference it.
    pub fn on_role_removed(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::Role, id, InvalidationAction::Remove)
    }

    pub fn on_client_updated(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::Client, id, InvalidationAction::Evict)
    }

    /// Evicts the client and its cached client roles.
    pub fn on_client_removed(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::Client, id, InvalidationAction::Remove)
    }

    pub fn on_group_updated(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::Group, id, InvalidationAction::Evict)
    }

    pub fn on_group_removed(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::Group, id, InvalidationAction::Remove)
    }

    pub fn on_user_updated(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::User, id, InvalidationAction::Evict)
    }

    pub fn on_user_removed(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::User, id, InvalidationAction::Remove)
    }

    /// A user joined or left a group. The group snapshot does not list its
    /// members, so it only moves forward; the user's memberships are stale.
    pub fn on_group_membership_changed(&self, user_id: &str, group_id: &str) -> WardenResult<()> {
        self.changed(EntityKind::Group, group_id, InvalidationAction::Advance)?;
        self.changed(EntityKind::User, user_id, InvalidationAction::Evict)?;
        Ok(())
    }

    pub fn on_identity_provider_updated(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::IdentityProvider, id, InvalidationAction::Evict)
    }

    pub fn on_identity_provider_removed(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::IdentityProvider, id, InvalidationAction::Remove)
    }

    pub fn on_user_session_updated(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::UserSession, id, InvalidationAction::Evict)
    }

    pub fn on_user_session_removed(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::UserSession, id, InvalidationAction::Remove)
    }

    /// Realm settings changed: drop the realm's lookup hints.
    pub fn on_realm_updated(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::Realm, id, InvalidationAction::Evict)
    }

    /// Drop everything cached for the realm.
    pub fn on_realm_removed(&self, id: &str) -> WardenResult<Revision> {
        self.changed(EntityKind::Realm, id, InvalidationAction::Remove)
    }

    /// Apply an invalidation published by another node.
    pub fn apply_remote(&self, message: &InvalidationMessage) {
        tracing::debug!(
            kind = %message.kind,
            id = %message.id,
            revision = message.revision,
            origin = %message.origin,
            "Applying remote invalidation"
        );
        self.apply(message.kind, &message.id, message.revision, message.action);
    }

    // === Maintenance ===

    /// Drop every cached entry and lookup hint.
    pub fn clear(&self) {
        self.roles.clear();
        self.clients.clear();
        self.groups.clear();
        self.users.clear();
        self.identity_providers.clear();
        self.user_sessions.clear();
        self.lookups.clear();
    }

    /// Evict expired entries from every store.
    pub fn purge_expired(&self) -> usize {
        self.roles.purge_expired()
            + self.clients.purge_expired()
            + self.groups.purge_expired()
            + self.users.purge_expired()
            + self.identity_providers.purge_expired()
            + self.user_sessions.purge_expired()
    }

    /// Combined statistics of every store and the lookup cache.
    pub fn stats(&self) -> CacheStats {
        [
            self.roles.stats(),
            self.clients.stats(),
            self.groups.stats(),
            self.users.stats(),
            self.identity_providers.stats(),
            self.user_sessions.stats(),
            self.lookups.stats(),
        ]
        .iter()
        .fold(CacheStats::default(), |acc, s| acc.merge(s))
    }

    pub fn role_cache(&self) -> &RevisionedCacheStore<CachedRole> {
        &self.roles
    }

    pub fn client_cache(&self) -> &RevisionedCacheStore<CachedClient> {
        &self.clients
    }

    pub fn group_cache(&self) -> &RevisionedCacheStore<CachedGroup> {
        &self.groups
    }

    pub fn user_cache(&self) -> &RevisionedCacheStore<CachedUser> {
        &self.users
    }

    pub fn user_session_cache(&self) -> &RevisionedCacheStore<CachedUserSession> {
        &self.user_sessions
    }

    // === Internals ===

    fn changed(
        &self,
        kind: EntityKind,
        id: &str,
        action: InvalidationAction,
    ) -> WardenResult<Revision> {
        let revision = self.store.next_revision()?;
        self.apply(kind, id, revision, action);

        if let Some(bus) = &self.bus {
            let message = InvalidationMessage {
                kind,
                id: id.to_string(),
                revision,
                action,
                origin: self.config.node_id.clone(),
            };
            // The local cache is already correct; peers catch up on their next lag reset.
            if let Err(e) = bus.publish(message) {
                tracing::warn!(kind = %kind, id = %id, error = %e, "Failed to publish invalidation");
            }
        }
        Ok(revision)
    }

    fn apply(&self, kind: EntityKind, id: &str, revision: Revision, action: InvalidationAction) {
        match action {
            InvalidationAction::Evict => self.evict(kind, id, revision),
            InvalidationAction::Advance => self.advance(kind, id, revision),
            InvalidationAction::Remove => {
                self.evict(kind, id, revision);
                self.cascade_removal(kind, id, revision);
            }
        }
    }

    fn evict(&self, kind: EntityKind, id: &str, revision: Revision) {
        match kind {
            EntityKind::Realm => {
                self.lookups.invalidate_realm(id);
            }
            EntityKind::Role => {
                self.roles.invalidate(id, revision);
            }
            EntityKind::Client => {
                self.clients.invalidate(id, revision);
            }
            EntityKind::Group => {
                self.groups.invalidate(id, revision);
            }
            EntityKind::User => {
                self.users.invalidate(id, revision);
            }
            EntityKind::IdentityProvider => {
                self.identity_providers.invalidate(id, revision);
            }
            EntityKind::UserSession => {
                self.user_sessions.invalidate(id, revision);
            }
        }
    }

    fn advance(&self, kind: EntityKind, id: &str, revision: Revision) {
        match kind {
            EntityKind::Realm => {}
            EntityKind::Role => {
                self.roles.advance(id, revision);
            }
            EntityKind::Client => {
                self.clients.advance(id, revision);
            }
            EntityKind::Group => {
                self.groups.advance(id, revision);
            }
            EntityKind::User => {
                self.users.advance(id, revision);
            }
            EntityKind::IdentityProvider => {
                self.identity_providers.advance(id, revision);
            }
            EntityKind::UserSession => {
                self.user_sessions.advance(id, revision);
            }
        }
    }

    fn cascade_removal(&self, kind: EntityKind, id: &str, revision: Revision) {
        let references = |ids: Option<&BTreeSet<EntityId>>| ids.is_some_and(|ids| ids.contains(id));

        let evicted = match kind {
            EntityKind::Role => {
                self.roles
                    .invalidate_where(revision, |r| references(r.materialized_composites()))
                    .len()
                    + self
                        .groups
                        .invalidate_where(revision, |g| references(g.materialized_role_mappings()))
                        .len()
                    + self
                        .users
                        .invalidate_where(revision, |u| references(u.materialized_role_mappings()))
                        .len()
            }
            EntityKind::Client => self
                .roles
                .invalidate_where(revision, |r| r.client_id.as_deref() == Some(id))
                .len(),
            EntityKind::Group => {
                self.groups
                    .invalidate_where(revision, |g| g.parent_id.as_deref() == Some(id))
                    .len()
                    + self
                        .users
                        .invalidate_where(revision, |u| references(u.materialized_group_ids()))
                        .len()
            }
            EntityKind::User => self
                .user_sessions
                .invalidate_where(revision, |s| s.user_id == id)
                .len(),
            EntityKind::Realm => {
                self.roles.invalidate_where(revision, |e| e.realm_id == id).len()
                    + self.clients.invalidate_where(revision, |e| e.realm_id == id).len()
                    + self.groups.invalidate_where(revision, |e| e.realm_id == id).len()
                    + self.users.invalidate_where(revision, |e| e.realm_id == id).len()
                    + self
                        .identity_providers
                        .invalidate_where(revision, |e| e.realm_id == id)
                        .len()
                    + self
                        .user_sessions
                        .invalidate_where(revision, |e| e.realm_id == id)
                        .len()
            }
            EntityKind::IdentityProvider | EntityKind::UserSession => 0,
        };

        if evicted > 0 {
            tracing::debug!(kind = %kind, id = %id, evicted, "Evicted dependent entries");
        }
    }
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("node_id", &self.config.node_id)
            .field("roles", &self.roles)
            .field("groups", &self.groups)
            .field("users", &self.users)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryIdentityStore;
    use chrono::Utc;
    use warden_core::{GroupModel, UserModel};

    const REALM: &str = "realm";

    fn role(id: &str, composites: &[&str]) -> RoleModel {
        RoleModel {
            id: id.to_string(),
            realm_id: REALM.to_string(),
            name: id.to_string(),
            client_id: None,
            description: None,
            composite_ids: composites.iter().map(|c| c.to_string()).collect(),
            attributes: BTreeMap::new(),
        }
    }

    fn group(id: &str, parent: Option<&str>, roles: &[&str]) -> GroupModel {
        GroupModel {
            id: id.to_string(),
            realm_id: REALM.to_string(),
            name: id.to_string(),
            parent_id: parent.map(str::to_string),
            role_ids: roles.iter().map(|r| r.to_string()).collect(),
            attributes: BTreeMap::new(),
        }
    }

    fn user(id: &str, roles: &[&str], groups: &[&str]) -> UserModel {
        UserModel {
            id: id.to_string(),
            realm_id: REALM.to_string(),
            username: id.to_string(),
            email: None,
            enabled: true,
            attributes: BTreeMap::new(),
            role_ids: roles.iter().map(|r| r.to_string()).collect(),
            group_ids: groups.iter().map(|g| g.to_string()).collect(),
            created_at: Utc::now(),
        }
    }

    fn setup() -> (Arc<InMemoryIdentityStore>, IdentityCache) {
        let store = Arc::new(InMemoryIdentityStore::new());
        let cache = IdentityCache::new(store.clone(), CacheConfig::default());
        (store, cache)
    }

    #[test]
    fn test_read_through_caches() {
        let (store, cache) = setup();
        store.upsert_role(role("admin", &[])).unwrap();

        assert!(cache.role("admin").unwrap().is_some());
        assert!(cache.role("admin").unwrap().is_some());
        let stats = cache.role_cache().stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert!(cache.role("missing").unwrap().is_none());
    }

    #[test]
    fn test_update_hook_evicts() {
        let (store, cache) = setup();
        store.upsert_role(role("admin", &[])).unwrap();
        cache.role("admin").unwrap();

        let mut changed = role("admin", &[]);
        changed.description = Some("changed".to_string());
        store.upsert_role(changed).unwrap();
        let revision = cache.on_role_updated("admin").unwrap();

        let reloaded = cache.role("admin").unwrap().unwrap();
        assert_eq!(reloaded.description.as_deref(), Some("changed"));
        assert_eq!(reloaded.revision(), revision);
    }

    #[test]
    fn test_expand_composites_tolerates_cycles() {
        let (store, cache) = setup();
        store.upsert_role(role("a", &["b"])).unwrap();
        store.upsert_role(role("b", &["c", "a"])).unwrap();
        store.upsert_role(role("c", &[])).unwrap();

        let expanded = cache.expand_composites("a").unwrap();
        assert_eq!(expanded.len(), 3);
    }

    #[test]
    fn test_user_has_role_through_parent_group_composite() {
        let (store, cache) = setup();
        store.upsert_role(role("admin", &["view"])).unwrap();
        store.upsert_role(role("view", &[])).unwrap();
        store.upsert_group(group("parent", None, &["admin"])).unwrap();
        store.upsert_group(group("child", Some("parent"), &[])).unwrap();
        store.upsert_user(user("u1", &[], &["child"])).unwrap();

        assert!(cache.user_has_role("u1", "view").unwrap());
        assert!(!cache.user_has_role("u1", "other").unwrap());
        assert!(!cache.user_has_role("nobody", "view").unwrap());
    }

    #[test]
    fn test_role_removal_cascades_over_materialized_fields() {
        let (store, cache) = setup();
        store.upsert_role(role("parent", &["child"])).unwrap();
        store.upsert_role(role("child", &[])).unwrap();
        store.upsert_role(role("unrelated", &[])).unwrap();
        store.upsert_group(group("g", None, &["child"])).unwrap();
        store.upsert_user(user("u", &["child"], &[])).unwrap();
        store.upsert_user(user("lazy", &["child"], &[])).unwrap();

        cache.expand_composites("parent").unwrap();
        cache.role("unrelated").unwrap();
        cache.group("g").unwrap().unwrap().role_mappings(store.as_ref()).unwrap();
        cache.user("u").unwrap().unwrap().role_mappings(store.as_ref()).unwrap();
        // Loaded but never materialized: not a candidate for the cascade.
        cache.user("lazy").unwrap();

        store.remove_role("child").unwrap();
        cache.on_role_removed("child").unwrap();

        assert!(cache.role_cache().get("parent").is_none());
        assert!(cache.role_cache().get("child").is_none());
        assert!(cache.role_cache().get("unrelated").is_some());
        assert!(cache.group_cache().get("g").is_none());
        assert!(cache.user_cache().get("u").is_none());
        assert!(cache.user_cache().get("lazy").is_some());
    }

    #[test]
    fn test_group_membership_change_advances_group() {
        let (store, cache) = setup();
        store.upsert_group(group("g", None, &[])).unwrap();
        store.upsert_user(user("u", &[], &[])).unwrap();
        let cached_group = cache.group("g").unwrap().unwrap();
        cache.user("u").unwrap();

        cache.on_group_membership_changed("u", "g").unwrap();

        let still_cached = cache.group_cache().get("g").unwrap();
        assert!(Arc::ptr_eq(&cached_group, &still_cached));
        assert!(still_cached.revision() > 0);
        assert!(cache.user_cache().get("u").is_none());
    }

    #[test]
    fn test_apply_remote_is_idempotent_and_order_tolerant() {
        let (store, cache) = setup();
        store.upsert_role(role("r", &[])).unwrap();
        cache.role("r").unwrap();

        let newer = InvalidationMessage::evict(EntityKind::Role, "r", 10, "node-b");
        let older = InvalidationMessage::evict(EntityKind::Role, "r", 4, "node-b");
        cache.apply_remote(&newer);
        cache.role("r").unwrap();
        cache.apply_remote(&older);
        cache.apply_remote(&newer);

        let cached = cache.role_cache().get("r").unwrap();
        assert_eq!(cached.revision(), 10);
    }

    #[test]
    fn test_realm_removal_clears_realm() {
        let (store, cache) = setup();
        store.upsert_role(role("r", &[])).unwrap();
        cache.role("r").unwrap();
        cache.role_from_string(REALM, "r").unwrap();
        assert_eq!(cache.lookups().len(), 1);

        cache.on_realm_removed(REALM).unwrap();
        assert!(cache.role_cache().is_empty());
        assert!(cache.lookups().is_empty());
    }
}
