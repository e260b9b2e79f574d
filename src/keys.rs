//! Key and tag normalization.
//!
//! Every logical name is mapped to a physical storage key deterministically:
//!
//! ```text
//! entry:  {prefix}{hash(name)}
//! tag:    __tag__:{prefix}{hash(tag)}
//! lock:   __lock__:{physical key being guarded}
//! ```
//!
//! The reserved literals sit in front of the prefix so a backend can tell the
//! three key spaces apart with a single `starts_with`. Entry keys that would
//! land in a reserved space are rejected as invalid input.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Reserved literal in front of every tag index key
pub const TAG_NAMESPACE: &str = "__tag__:";

/// Reserved literal in front of every lock token key
pub const LOCK_NAMESPACE: &str = "__lock__:";

/// Hash applied to a logical name before prefixing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// Use the name as-is
    #[default]
    None,
    /// Lowercase hex MD5 digest
    Md5,
    /// Lowercase hex SHA-1 digest
    Sha1,
}

impl HashAlgorithm {
    /// Apply the hash to a name
    pub fn apply(&self, name: &str) -> String {
        match self {
            HashAlgorithm::None => name.to_string(),
            HashAlgorithm::Md5 => hex::encode(Md5::digest(name.as_bytes())),
            HashAlgorithm::Sha1 => hex::encode(Sha1::digest(name.as_bytes())),
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashAlgorithm::None => write!(f, "none"),
            HashAlgorithm::Md5 => write!(f, "md5"),
            HashAlgorithm::Sha1 => write!(f, "sha1"),
        }
    }
}

/// Lock token key guarding a physical key
pub fn lock_key_of(physical: &str) -> String {
    format!("{}{}", LOCK_NAMESPACE, physical)
}

/// Which reserved space a physical key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpace {
    /// A user cache entry
    Entry,
    /// A tag index entry
    Tag,
    /// A lock token
    Lock,
}

impl KeySpace {
    /// Classify a physical key
    pub fn of(physical: &str) -> Self {
        if physical.starts_with(LOCK_NAMESPACE) {
            KeySpace::Lock
        } else if physical.starts_with(TAG_NAMESPACE) {
            KeySpace::Tag
        } else {
            KeySpace::Entry
        }
    }

    /// Short directory-safe label
    pub fn label(&self) -> &'static str {
        match self {
            KeySpace::Entry => "entries",
            KeySpace::Tag => "tags",
            KeySpace::Lock => "locks",
        }
    }
}

/// Derives physical keys from logical names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyNormalizer {
    prefix: String,
    key_hash: HashAlgorithm,
    tag_hash: HashAlgorithm,
}

impl KeyNormalizer {
    /// Create a normalizer
    pub fn new(prefix: impl Into<String>, key_hash: HashAlgorithm, tag_hash: HashAlgorithm) -> Self {
        Self {
            prefix: prefix.into(),
            key_hash,
            tag_hash,
        }
    }

    /// Configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Physical key for a logical name, or `None` for invalid input
    pub fn normalize_key(&self, name: &str) -> Option<String> {
        if name.is_empty() {
            return None;
        }
        let physical = format!("{}{}", self.prefix, self.key_hash.apply(name));
        match KeySpace::of(&physical) {
            KeySpace::Entry => Some(physical),
            _ => None,
        }
    }

    /// Physical tag index key for a tag name, or `None` for an empty tag
    pub fn normalize_tag(&self, name: &str) -> Option<String> {
        if name.is_empty() {
            return None;
        }
        Some(format!(
            "{}{}{}",
            TAG_NAMESPACE,
            self.prefix,
            self.tag_hash.apply(name)
        ))
    }

    /// Lock token key guarding a physical key
    pub fn lock_key(&self, physical: &str) -> String {
        lock_key_of(physical)
    }

    /// True for entry keys owned by this normalizer's prefix
    pub fn owns_entry(&self, physical: &str) -> bool {
        KeySpace::of(physical) == KeySpace::Entry && physical.starts_with(&self.prefix)
    }

    /// Physical key with the prefix removed
    pub fn strip_prefix<'a>(&self, physical: &'a str) -> &'a str {
        physical.strip_prefix(self.prefix.as_str()).unwrap_or(physical)
    }

    /// Key prefixes covering everything this normalizer can produce.
    ///
    /// Returns an empty list when the prefix is empty, meaning "the whole
    /// backend namespace".
    pub fn namespace_prefixes(&self) -> Vec<String> {
        if self.prefix.is_empty() {
            return Vec::new();
        }
        vec![
            self.prefix.clone(),
            format!("{}{}", TAG_NAMESPACE, self.prefix),
            format!("{}{}", LOCK_NAMESPACE, self.prefix),
            format!("{}{}{}", LOCK_NAMESPACE, TAG_NAMESPACE, self.prefix),
        ]
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plain_key_with_prefix() {
        let n = KeyNormalizer::new("app:", HashAlgorithm::None, HashAlgorithm::None);
        assert_eq!(n.normalize_key("user:1").as_deref(), Some("app:user:1"));
        assert_eq!(n.normalize_tag("users").as_deref(), Some("__tag__:app:users"));
    }

    #[test]
    fn test_empty_names_are_rejected() {
        let n = KeyNormalizer::default();
        assert!(n.normalize_key("").is_none());
        assert!(n.normalize_tag("").is_none());
    }

    #[test]
    fn test_reserved_namespaces_rejected_for_entries() {
        let n = KeyNormalizer::default();
        assert!(n.normalize_key("__tag__:users").is_none());
        assert!(n.normalize_key("__lock__:x").is_none());
        // hashing moves the key out of the reserved space
        let hashed = KeyNormalizer::new("", HashAlgorithm::Md5, HashAlgorithm::None);
        assert!(hashed.normalize_key("__tag__:users").is_some());
    }

    #[test]
    fn test_known_digests() {
        assert_eq!(
            HashAlgorithm::Md5.apply("hello"),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            HashAlgorithm::Sha1.apply("hello"),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }

    #[test]
    fn test_independent_tag_hash() {
        let n = KeyNormalizer::new("p", HashAlgorithm::Sha1, HashAlgorithm::None);
        assert_eq!(n.normalize_tag("t").as_deref(), Some("__tag__:pt"));
        assert_eq!(n.normalize_key("k").unwrap().len(), 1 + 40);
    }

    #[test]
    fn test_key_space_classification() {
        let n = KeyNormalizer::new("app:", HashAlgorithm::None, HashAlgorithm::None);
        let entry = n.normalize_key("k").unwrap();
        let tag = n.normalize_tag("t").unwrap();
        assert_eq!(KeySpace::of(&entry), KeySpace::Entry);
        assert_eq!(KeySpace::of(&tag), KeySpace::Tag);
        assert_eq!(KeySpace::of(&n.lock_key(&entry)), KeySpace::Lock);
        assert_eq!(KeySpace::of(&n.lock_key(&tag)), KeySpace::Lock);
    }

    #[test]
    fn test_owns_entry_and_strip() {
        let n = KeyNormalizer::new("app:", HashAlgorithm::None, HashAlgorithm::None);
        assert!(n.owns_entry("app:user:1"));
        assert!(!n.owns_entry("other:user:1"));
        assert!(!n.owns_entry("__tag__:app:users"));
        assert_eq!(n.strip_prefix("app:user:1"), "user:1");
    }

    #[test]
    fn test_namespace_prefixes_cover_all_spaces() {
        let n = KeyNormalizer::new("app:", HashAlgorithm::None, HashAlgorithm::None);
        let prefixes = n.namespace_prefixes();
        let entry = n.normalize_key("k").unwrap();
        let tag = n.normalize_tag("t").unwrap();
        for key in [entry.clone(), tag.clone(), n.lock_key(&entry), n.lock_key(&tag)] {
            assert!(prefixes.iter().any(|p| key.starts_with(p)), "{key}");
        }
        assert!(KeyNormalizer::default().namespace_prefixes().is_empty());
    }

    proptest! {
        #[test]
        fn prop_normalization_is_deterministic(name in "[a-z0-9:_]{1,40}", prefix in "[a-z]{0,8}") {
            for algo in [HashAlgorithm::None, HashAlgorithm::Md5, HashAlgorithm::Sha1] {
                let a = KeyNormalizer::new(prefix.clone(), algo, algo);
                let b = KeyNormalizer::new(prefix.clone(), algo, algo);
                prop_assert_eq!(a.normalize_key(&name), b.normalize_key(&name));
                prop_assert_eq!(a.normalize_tag(&name), b.normalize_tag(&name));
            }
        }

        #[test]
        fn prop_prefix_is_literal(name in "[a-z0-9]{1,40}", prefix in "[a-z]{1,8}") {
            let n = KeyNormalizer::new(prefix.clone(), HashAlgorithm::None, HashAlgorithm::None);
            prop_assert_eq!(n.normalize_key(&name).unwrap(), format!("{}{}", prefix, name));
        }
    }
}
