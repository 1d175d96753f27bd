//! Realm-scoped keys for the alternative lookup cache.
//!
//! A [`LookupKey`] can only be built from all three of its parts, so a
//! lookup cannot be cached without naming the realm it belongs to.

use sha2::{Digest, Sha256};
use std::fmt;

use warden_core::EntityId;

/// Separator byte between encoded key parts.
const SEPARATOR: u8 = 0xFF;

/// What a lookup key resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupCategory {
    /// Qualified role string to role.
    Role,
    /// Issuer URL to identity provider alias.
    IdentityProviderByIssuer,
    /// Attribute set to client id.
    ClientByAttributes,
}

impl LookupCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupCategory::Role => "role",
            LookupCategory::IdentityProviderByIssuer => "idp-by-issuer",
            LookupCategory::ClientByAttributes => "client-by-attributes",
        }
    }

    fn as_byte(&self) -> u8 {
        match self {
            LookupCategory::Role => 0,
            LookupCategory::IdentityProviderByIssuer => 1,
            LookupCategory::ClientByAttributes => 2,
        }
    }
}

impl fmt::Display for LookupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hashed key of one alternative lookup.
///
/// # Encoding
///
/// The digest is SHA-256 over:
/// - realm id bytes
/// - separator (0xFF)
/// - category discriminant (one byte)
/// - separator (0xFF)
/// - discriminator bytes
///
/// 0xFF never occurs in UTF-8, so distinct part triples cannot collide
/// before hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey {
    inner: LookupKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LookupKeyInner {
    realm_id: EntityId,
    category: LookupCategory,
    digest: [u8; 32],
}

impl LookupKey {
    /// Build the key for `discriminator` within `realm_id`.
    pub fn new(realm_id: &str, category: LookupCategory, discriminator: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(realm_id.as_bytes());
        hasher.update([SEPARATOR, category.as_byte(), SEPARATOR]);
        hasher.update(discriminator.as_bytes());

        Self {
            inner: LookupKeyInner {
                realm_id: realm_id.to_string(),
                category,
                digest: hasher.finalize().into(),
            },
        }
    }

    pub fn realm_id(&self) -> &str {
        &self.inner.realm_id
    }

    pub fn category(&self) -> LookupCategory {
        self.inner.category
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.inner.digest
    }

    /// Hex form of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.inner.digest)
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inner.category, &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_parts_same_key() {
        let a = LookupKey::new("realm", LookupCategory::Role, "app.admin");
        let b = LookupKey::new("realm", LookupCategory::Role, "app.admin");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn test_realm_and_category_separate_keys() {
        let base = LookupKey::new("realm", LookupCategory::Role, "x");
        assert_ne!(base, LookupKey::new("other", LookupCategory::Role, "x"));
        assert_ne!(
            base.digest(),
            LookupKey::new("realm", LookupCategory::ClientByAttributes, "x").digest()
        );
    }

    #[test]
    fn test_part_boundaries_do_not_collide() {
        let a = LookupKey::new("ab", LookupCategory::Role, "c");
        let b = LookupKey::new("a", LookupCategory::Role, "bc");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_display() {
        let key = LookupKey::new("realm", LookupCategory::IdentityProviderByIssuer, "https://idp");
        let shown = key.to_string();
        assert!(shown.starts_with("idp-by-issuer:"));
        assert_eq!(key.realm_id(), "realm");
        assert_eq!(key.category(), LookupCategory::IdentityProviderByIssuer);
    }
}
