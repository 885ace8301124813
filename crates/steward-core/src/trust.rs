//! Named controller signing keys.
//!
//! The controller operator distributes one or more named public keys to
//! the agent through configuration. Commands reference a key by name, so
//! the controller can roll to a new key while the old one ages out via
//! its expiry. The ring is immutable once built; rotation happens by
//! shipping new configuration.

use ed25519_dalek::VerifyingKey;
use thiserror::Error;

use steward_crypto::keys::{self, KeyDecodeError};

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while assembling the key ring.
#[derive(Debug, Error)]
pub enum KeyRingError {
    #[error("key name must not be empty")]
    EmptyName,

    /// Key names travel as one field of a dot-delimited token
    #[error("key name {0:?} must not contain '.'")]
    DottedName(String),

    #[error("duplicate key name: {0}")]
    DuplicateName(String),

    #[error("key {name}: {source}")]
    BadMaterial {
        name: String,
        source: KeyDecodeError,
    },
}

// ============================================================================
// Signing Key Entries
// ============================================================================

/// A named controller verifying key with an optional expiry.
#[derive(Debug, Clone)]
pub struct SigningKeyEntry {
    /// Name the controller uses to reference this key
    pub name: String,
    /// Decoded Ed25519 verifying key
    pub key: VerifyingKey,
    /// Unix timestamp after which the key stops resolving (optional)
    pub expires_at: Option<u64>,
}

impl SigningKeyEntry {
    /// Build an entry from configuration material (PEM, base64, or hex).
    pub fn from_material(
        name: impl Into<String>,
        material: &str,
        expires_at: Option<u64>,
    ) -> Result<Self, KeyRingError> {
        let name = name.into();
        let key = keys::verifying_key_from_str(material)
            .map_err(|source| KeyRingError::BadMaterial {
                name: name.clone(),
                source,
            })?;
        Ok(Self {
            name,
            key,
            expires_at,
        })
    }

    /// Whether the key resolves at `now`.
    pub fn is_live(&self, now: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }

    /// Short hex identifier for logs and listings. Public material, safe
    /// to print.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.key.to_bytes()[..8])
    }
}

// ============================================================================
// Key Ring
// ============================================================================

/// Immutable rotation set of named controller keys.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    entries: Vec<SigningKeyEntry>,
}

impl KeyRing {
    /// Validate and assemble a ring. Names must be non-empty, free of
    /// dots, and unique.
    pub fn new(entries: Vec<SigningKeyEntry>) -> Result<Self, KeyRingError> {
        for (i, entry) in entries.iter().enumerate() {
            if entry.name.is_empty() {
                return Err(KeyRingError::EmptyName);
            }
            if entry.name.contains('.') {
                return Err(KeyRingError::DottedName(entry.name.clone()));
            }
            if entries[..i].iter().any(|prior| prior.name == entry.name) {
                return Err(KeyRingError::DuplicateName(entry.name.clone()));
            }
        }
        Ok(Self { entries })
    }

    /// An empty ring; nothing resolves.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a key by name among entries live at `now`. Expired keys
    /// are indistinguishable from unknown ones.
    pub fn resolve_live(&self, name: &str, now: u64) -> Option<&SigningKeyEntry> {
        self.entries
            .iter()
            .find(|entry| entry.name == name && entry.is_live(now))
    }

    /// All configured entries, in configuration order.
    pub fn entries(&self) -> &[SigningKeyEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn make_test_entry(name: &str, expires_at: Option<u64>) -> SigningKeyEntry {
        SigningKeyEntry {
            name: name.to_string(),
            key: SigningKey::generate(&mut OsRng).verifying_key(),
            expires_at,
        }
    }

    #[test]
    fn test_entry_from_base64_material() {
        let key = SigningKey::generate(&mut OsRng).verifying_key();
        let material = BASE64.encode(key.as_bytes());

        let entry = SigningKeyEntry::from_material("primary", &material, None).unwrap();
        assert_eq!(entry.key, key);
        assert_eq!(entry.name, "primary");
    }

    #[test]
    fn test_entry_from_hex_material() {
        let key = SigningKey::generate(&mut OsRng).verifying_key();
        let material = hex::encode(key.as_bytes());

        let entry = SigningKeyEntry::from_material("primary", &material, Some(99)).unwrap();
        assert_eq!(entry.key, key);
        assert_eq!(entry.expires_at, Some(99));
    }

    #[test]
    fn test_entry_bad_material_names_the_key() {
        let err = SigningKeyEntry::from_material("broken", "not a key", None).unwrap_err();
        match err {
            KeyRingError::BadMaterial { name, .. } => assert_eq!(name, "broken"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_ring_rejects_duplicate_names() {
        let entries = vec![make_test_entry("primary", None), make_test_entry("primary", None)];
        assert!(matches!(
            KeyRing::new(entries),
            Err(KeyRingError::DuplicateName(name)) if name == "primary"
        ));
    }

    #[test]
    fn test_ring_rejects_dotted_names() {
        let entries = vec![make_test_entry("v1.primary", None)];
        assert!(matches!(
            KeyRing::new(entries),
            Err(KeyRingError::DottedName(_))
        ));
    }

    #[test]
    fn test_ring_rejects_empty_names() {
        let entries = vec![make_test_entry("", None)];
        assert!(matches!(KeyRing::new(entries), Err(KeyRingError::EmptyName)));
    }

    #[test]
    fn test_resolve_live_key() {
        let ring = KeyRing::new(vec![
            make_test_entry("primary", None),
            make_test_entry("rotated", Some(1000)),
        ])
        .unwrap();

        assert!(ring.resolve_live("primary", 5000).is_some());
        assert!(ring.resolve_live("rotated", 999).is_some());
    }

    #[test]
    fn test_resolve_expired_key_is_unknown() {
        let ring = KeyRing::new(vec![make_test_entry("rotated", Some(1000))]).unwrap();

        // Expiry boundary is exclusive.
        assert!(ring.resolve_live("rotated", 1000).is_none());
        assert!(ring.resolve_live("rotated", 1001).is_none());
    }

    #[test]
    fn test_resolve_unknown_name() {
        let ring = KeyRing::new(vec![make_test_entry("primary", None)]).unwrap();
        assert!(ring.resolve_live("secondary", 0).is_none());
    }

    #[test]
    fn test_empty_ring_resolves_nothing() {
        let ring = KeyRing::empty();
        assert!(ring.is_empty());
        assert!(ring.resolve_live("primary", 0).is_none());
    }

    #[test]
    fn test_fingerprint_is_short_hex() {
        let entry = make_test_entry("primary", None);
        let fp = entry.fingerprint();
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_entries_preserve_order() {
        let ring = KeyRing::new(vec![
            make_test_entry("a", None),
            make_test_entry("b", None),
            make_test_entry("c", None),
        ])
        .unwrap();
        let names: Vec<_> = ring.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
