//! Lookup resolution through the alternative lookup cache.
//!
//! All three resolvers follow one shape: read the cached hint, validate it
//! against the live model, fall back to a live search, and cache the result
//! only when the search was unambiguous.

use std::collections::BTreeMap;

use warden_core::{
    CacheError, ClientModel, IdentityProviderModel, RoleModel, WardenResult, ROLE_SEPARATOR,
};

use super::lookup::{AlternativeLookupCache, CachedValue, LookupResult};
use super::lookup_key::{LookupCategory, LookupKey};
use crate::IdentityStore;

/// Resolve a role from its string form.
///
/// `role_name` is either a realm role name or `<client_id>.<role_name>`,
/// where both parts may themselves contain dots. Candidate splits are tried
/// right to left, at most `max_client_lookups` of them. When the budget runs
/// out with separators still untried, resolution gives up and returns
/// `Ok(None)` instead of treating the whole string as a realm role.
pub fn lookup_role_from_string(
    cache: &AlternativeLookupCache,
    store: &dyn IdentityStore,
    realm_id: &str,
    role_name: &str,
    max_client_lookups: usize,
) -> WardenResult<Option<RoleModel>> {
    let key = LookupKey::new(realm_id, LookupCategory::Role, role_name);

    let cached = cache.lookup_and_validate(&key, |value| match value {
        CachedValue::RoleQualifier {
            client_id: Some(client_id),
            role_name,
        } => match store.client_by_client_id(realm_id, client_id)? {
            Some(client) => store.client_role(realm_id, &client.id, role_name),
            None => Ok(None),
        },
        CachedValue::RoleQualifier {
            client_id: None,
            role_name,
        } => store.realm_role(realm_id, role_name),
        CachedValue::String(_) => Ok(None),
    })?;
    if let LookupResult::Hit(role) = cached {
        return Ok(Some(role));
    }

    let separators = role_name.matches(ROLE_SEPARATOR).count();
    let mut lookups = 0usize;
    let mut end = role_name.len();

    while let Some(index) = role_name[..end].rfind(ROLE_SEPARATOR) {
        if lookups >= max_client_lookups {
            tracing::warn!(
                realm_id = %realm_id,
                separators,
                budget = max_client_lookups,
                "Role lookup budget exhausted"
            );
            return Ok(None);
        }
        lookups += 1;

        let client_part = &role_name[..index];
        let role_part = &role_name[index + ROLE_SEPARATOR.len_utf8()..];
        if let Some(client) = store.client_by_client_id(realm_id, client_part)? {
            let role = store.client_role(realm_id, &client.id, role_part)?;
            // One-dot names are already cheap to resolve through the client lookup.
            if role.is_some() && separators > 1 {
                cache.put(
                    key,
                    CachedValue::RoleQualifier {
                        client_id: Some(client_part.to_string()),
                        role_name: role_part.to_string(),
                    },
                );
            }
            return Ok(role);
        }
        end = index;
    }

    let role = store.realm_role(realm_id, role_name)?;
    if role.is_some() {
        cache.put(
            key,
            CachedValue::RoleQualifier {
                client_id: None,
                role_name: role_name.to_string(),
            },
        );
    }
    Ok(role)
}

/// Resolve the single identity provider configured with `issuer`.
///
/// Two or more providers sharing the issuer is an
/// [`CacheError::AmbiguousResolution`]; nothing is cached in that case.
pub fn lookup_identity_provider_from_issuer(
    cache: &AlternativeLookupCache,
    store: &dyn IdentityStore,
    realm_id: &str,
    issuer: &str,
) -> WardenResult<Option<IdentityProviderModel>> {
    let key = LookupKey::new(realm_id, LookupCategory::IdentityProviderByIssuer, issuer);

    let cached = cache.lookup_and_validate(&key, |value| match value {
        CachedValue::String(alias) => Ok(store
            .identity_provider_by_alias(realm_id, alias)?
            .filter(|idp| idp.issuer() == Some(issuer))),
        CachedValue::RoleQualifier { .. } => Ok(None),
    })?;
    if let LookupResult::Hit(idp) = cached {
        return Ok(Some(idp));
    }

    let mut matches: Vec<IdentityProviderModel> = store
        .identity_providers(realm_id)?
        .into_iter()
        .filter(|idp| idp.issuer() == Some(issuer))
        .collect();

    match matches.len() {
        0 => Ok(None),
        1 => {
            let idp = matches.remove(0);
            cache.put(key, CachedValue::String(idp.alias.clone()));
            Ok(Some(idp))
        }
        n => Err(CacheError::AmbiguousResolution {
            category: LookupCategory::IdentityProviderByIssuer.to_string(),
            criteria: issuer.to_string(),
            matches: n,
        }
        .into()),
    }
}

/// Resolve the single client carrying every attribute in `attributes`.
///
/// An empty attribute set matches nothing. More than one matching client is
/// an [`CacheError::AmbiguousResolution`].
pub fn lookup_client_from_attributes(
    cache: &AlternativeLookupCache,
    store: &dyn IdentityStore,
    realm_id: &str,
    attributes: &BTreeMap<String, String>,
) -> WardenResult<Option<ClientModel>> {
    if attributes.is_empty() {
        return Ok(None);
    }
    let criteria = attribute_discriminator(attributes);
    let key = LookupKey::new(realm_id, LookupCategory::ClientByAttributes, &criteria);

    let cached = cache.lookup_and_validate(&key, |value| match value {
        CachedValue::String(client_id) => Ok(store
            .client_by_client_id(realm_id, client_id)?
            .filter(|client| client.matches_attributes(attributes))),
        CachedValue::RoleQualifier { .. } => Ok(None),
    })?;
    if let LookupResult::Hit(client) = cached {
        return Ok(Some(client));
    }

    let mut matches: Vec<ClientModel> = store
        .clients(realm_id)?
        .into_iter()
        .filter(|client| client.matches_attributes(attributes))
        .collect();

    match matches.len() {
        0 => Ok(None),
        1 => {
            let client = matches.remove(0);
            cache.put(key, CachedValue::String(client.client_id.clone()));
            Ok(Some(client))
        }
        n => Err(CacheError::AmbiguousResolution {
            category: LookupCategory::ClientByAttributes.to_string(),
            criteria,
            matches: n,
        }
        .into()),
    }
}

// Sorted `name=value` pairs joined with newlines; BTreeMap iteration is ordered.
fn attribute_discriminator(attributes: &BTreeMap<String, String>) -> String {
    attributes
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryIdentityStore;
    use std::collections::BTreeSet;
    use warden_core::ISSUER_CONFIG_KEY;

    const REALM: &str = "realm";

    fn client(id: &str, client_id: &str) -> ClientModel {
        ClientModel {
            id: id.to_string(),
            realm_id: REALM.to_string(),
            client_id: client_id.to_string(),
            name: None,
            enabled: true,
            attributes: BTreeMap::new(),
        }
    }

    fn role(id: &str, name: &str, client_internal_id: Option<&str>) -> RoleModel {
        RoleModel {
            id: id.to_string(),
            realm_id: REALM.to_string(),
            name: name.to_string(),
            client_id: client_internal_id.map(str::to_string),
            description: None,
            composite_ids: BTreeSet::new(),
            attributes: BTreeMap::new(),
        }
    }

    fn idp(internal_id: &str, alias: &str, issuer: &str) -> IdentityProviderModel {
        let mut config = BTreeMap::new();
        config.insert(ISSUER_CONFIG_KEY.to_string(), issuer.to_string());
        IdentityProviderModel {
            internal_id: internal_id.to_string(),
            realm_id: REALM.to_string(),
            alias: alias.to_string(),
            enabled: true,
            config,
        }
    }

    #[test]
    fn test_realm_role_is_cached() {
        let store = InMemoryIdentityStore::new();
        let cache = AlternativeLookupCache::new();
        store.upsert_role(role("r1", "admin", None)).unwrap();

        let found = lookup_role_from_string(&cache, &store, REALM, "admin", 25).unwrap();
        assert_eq!(found.unwrap().id, "r1");
        assert_eq!(cache.len(), 1);

        let again = lookup_role_from_string(&cache, &store, REALM, "admin", 25).unwrap();
        assert_eq!(again.unwrap().id, "r1");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_one_dot_client_role_not_cached() {
        let store = InMemoryIdentityStore::new();
        let cache = AlternativeLookupCache::new();
        store.upsert_client(client("c1", "app")).unwrap();
        store.upsert_role(role("r1", "admin", Some("c1"))).unwrap();

        let found = lookup_role_from_string(&cache, &store, REALM, "app.admin", 25).unwrap();
        assert_eq!(found.unwrap().id, "r1");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_dotted_client_id_resolves_and_caches() {
        let store = InMemoryIdentityStore::new();
        let cache = AlternativeLookupCache::new();
        store.upsert_client(client("c1", "org.app")).unwrap();
        store.upsert_role(role("r1", "admin", Some("c1"))).unwrap();

        let found = lookup_role_from_string(&cache, &store, REALM, "org.app.admin", 25).unwrap();
        assert_eq!(found.unwrap().id, "r1");
        assert_eq!(
            cache.get(&LookupKey::new(REALM, LookupCategory::Role, "org.app.admin")),
            Some(CachedValue::RoleQualifier {
                client_id: Some("org.app".to_string()),
                role_name: "admin".to_string(),
            })
        );
    }

    #[test]
    fn test_dotted_realm_role_falls_back() {
        let store = InMemoryIdentityStore::new();
        let cache = AlternativeLookupCache::new();
        store.upsert_role(role("r1", "a.b", None)).unwrap();

        let found = lookup_role_from_string(&cache, &store, REALM, "a.b", 25).unwrap();
        assert_eq!(found.unwrap().id, "r1");
    }

    #[test]
    fn test_budget_exhausted_returns_none() {
        let store = InMemoryIdentityStore::new();
        let cache = AlternativeLookupCache::new();
        store.upsert_role(role("r1", "a.b.c.d", None)).unwrap();

        // Three separators, budget two: gives up instead of trying the realm role.
        let found = lookup_role_from_string(&cache, &store, REALM, "a.b.c.d", 2).unwrap();
        assert!(found.is_none());

        let found = lookup_role_from_string(&cache, &store, REALM, "a.b.c.d", 3).unwrap();
        assert_eq!(found.unwrap().id, "r1");
    }

    #[test]
    fn test_stale_cached_role_is_revalidated() {
        let store = InMemoryIdentityStore::new();
        let cache = AlternativeLookupCache::new();
        store.upsert_client(client("c1", "org.app")).unwrap();
        store.upsert_role(role("r1", "admin", Some("c1"))).unwrap();
        lookup_role_from_string(&cache, &store, REALM, "org.app.admin", 25).unwrap();

        store.remove_role("r1").unwrap();
        let found = lookup_role_from_string(&cache, &store, REALM, "org.app.admin", 25).unwrap();
        assert!(found.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_identity_provider_single_match_cached() {
        let store = InMemoryIdentityStore::new();
        let cache = AlternativeLookupCache::new();
        store.upsert_identity_provider(idp("i1", "corp", "https://idp.example")).unwrap();

        let found = lookup_identity_provider_from_issuer(&cache, &store, REALM, "https://idp.example")
            .unwrap();
        assert_eq!(found.unwrap().alias, "corp");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_identity_provider_issuer_changed_invalidates() {
        let store = InMemoryIdentityStore::new();
        let cache = AlternativeLookupCache::new();
        store.upsert_identity_provider(idp("i1", "corp", "https://idp.example")).unwrap();
        lookup_identity_provider_from_issuer(&cache, &store, REALM, "https://idp.example").unwrap();

        store.upsert_identity_provider(idp("i1", "corp", "https://moved.example")).unwrap();
        let found = lookup_identity_provider_from_issuer(&cache, &store, REALM, "https://idp.example")
            .unwrap();
        assert!(found.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ambiguous_identity_provider_is_error() {
        let store = InMemoryIdentityStore::new();
        let cache = AlternativeLookupCache::new();
        store.upsert_identity_provider(idp("i1", "corp", "https://idp.example")).unwrap();
        store.upsert_identity_provider(idp("i2", "corp-2", "https://idp.example")).unwrap();

        let err = lookup_identity_provider_from_issuer(&cache, &store, REALM, "https://idp.example")
            .unwrap_err();
        assert!(err.is_ambiguous_resolution());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_client_from_attributes() {
        let store = InMemoryIdentityStore::new();
        let cache = AlternativeLookupCache::new();
        let mut saml = client("c1", "saml-app");
        saml.attributes
            .insert("saml.entity".to_string(), "urn:sp".to_string());
        store.upsert_client(saml).unwrap();
        store.upsert_client(client("c2", "other")).unwrap();

        let mut wanted = BTreeMap::new();
        assert!(lookup_client_from_attributes(&cache, &store, REALM, &wanted)
            .unwrap()
            .is_none());

        wanted.insert("saml.entity".to_string(), "urn:sp".to_string());
        let found = lookup_client_from_attributes(&cache, &store, REALM, &wanted).unwrap();
        assert_eq!(found.unwrap().client_id, "saml-app");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_attribute_discriminator_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());
        assert_eq!(attribute_discriminator(&a), "a=1\nb=2");
    }
}
