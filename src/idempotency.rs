//! Deterministic idempotency keys
//!
//! A key is a pure function of `(operation, ordered arguments, metadata)`.
//! Metadata is hashed in key order, so callers may build it in any order.
//! Each field is length-prefixed before hashing, which keeps `("a:b", "c")`
//! and `("a", "b:c")` apart.

use crate::types::Metadata;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters kept from the SHA-256 digest
pub const KEY_LENGTH: usize = 32;

/// HTTP header carrying the key on provider requests
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Operation tags used by the workflows in this crate
pub mod operations {
    pub const CREATE_DATASET: &str = "create_dataset";
    pub const ADD_PIECE: &str = "add_piece";
    pub const ADD_PIECES_BATCH: &str = "add_pieces_batch";
    pub const UPLOAD_PIECE: &str = "upload_piece";
}

/// Opaque fixed-length token guarding a side effect against duplication
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive the key for `operation` over `args` and optional `metadata`
    pub fn derive(operation: &str, args: &[&str], metadata: Option<&Metadata>) -> Self {
        let mut hasher = Sha256::new();
        write_field(&mut hasher, operation.as_bytes());

        hasher.update((args.len() as u64).to_be_bytes());
        for arg in args {
            write_field(&mut hasher, arg.as_bytes());
        }

        // Absent and empty metadata hash the same
        let empty = Metadata::new();
        let metadata = metadata.unwrap_or(&empty);
        hasher.update((metadata.len() as u64).to_be_bytes());
        for (key, value) in metadata {
            write_field(&mut hasher, key.as_bytes());
            write_field(&mut hasher, value.as_bytes());
        }

        let mut encoded = hex::encode(hasher.finalize());
        encoded.truncate(KEY_LENGTH);
        IdempotencyKey(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_is_deterministic() {
        let meta = metadata(&[("source", "demo"), ("withCDN", "")]);
        let key1 = IdempotencyKey::derive("create_dataset", &["0xabc", "1", "7"], Some(&meta));
        let key2 = IdempotencyKey::derive("create_dataset", &["0xabc", "1", "7"], Some(&meta));
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_metadata_order_is_irrelevant() {
        let forward = metadata(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let reverse = metadata(&[("c", "3"), ("b", "2"), ("a", "1")]);

        assert_eq!(
            IdempotencyKey::derive("add_piece", &["5", "cid"], Some(&forward)),
            IdempotencyKey::derive("add_piece", &["5", "cid"], Some(&reverse)),
        );
    }

    #[test]
    fn test_any_field_change_changes_key() {
        let meta = metadata(&[("a", "1")]);
        let base = IdempotencyKey::derive("create_dataset", &["addr", "1", "7"], Some(&meta));

        assert_ne!(
            base,
            IdempotencyKey::derive("add_piece", &["addr", "1", "7"], Some(&meta))
        );
        assert_ne!(
            base,
            IdempotencyKey::derive("create_dataset", &["addr", "2", "7"], Some(&meta))
        );
        assert_ne!(
            base,
            IdempotencyKey::derive("create_dataset", &["addr", "1", "8"], Some(&meta))
        );

        let changed_value = metadata(&[("a", "2")]);
        assert_ne!(
            base,
            IdempotencyKey::derive("create_dataset", &["addr", "1", "7"], Some(&changed_value))
        );

        let extra_key = metadata(&[("a", "1"), ("b", "")]);
        assert_ne!(
            base,
            IdempotencyKey::derive("create_dataset", &["addr", "1", "7"], Some(&extra_key))
        );
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        assert_ne!(
            IdempotencyKey::derive("op", &["a:b", "c"], None),
            IdempotencyKey::derive("op", &["a", "b:c"], None),
        );
        assert_ne!(
            IdempotencyKey::derive("op", &["ab"], None),
            IdempotencyKey::derive("op", &["a", "b"], None),
        );
    }

    #[test]
    fn test_key_shape() {
        let key = IdempotencyKey::derive("test", &["arg"], None);
        assert_eq!(key.as_str().len(), KEY_LENGTH);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            key,
            IdempotencyKey::derive("test", &["arg"], Some(&Metadata::new()))
        );
    }
}
