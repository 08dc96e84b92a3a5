//! Byte-blob store with conditional writes.
//!
//! The engine never assumes multi-record transactions. Every record carries a
//! version tag; a write names the tag it read and fails with
//! [`StoreError::Conflict`] if someone else wrote in between.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::StoreError;

/// Default per-record ceiling, the value limit of common hosted KV stores
pub const DEFAULT_MAX_RECORD_BYTES: usize = 25 * 1024 * 1024;

/// A stored value together with its version tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// What a conditional write expects to find
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The key must not exist yet
    Absent,
    /// The key must still be at this version
    Version(u64),
    /// Unconditional overwrite. Only for derived records that can be rebuilt.
    Any,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>, StoreError>;

    /// Write `value` if `expect` holds; returns the new version
    async fn put(&self, key: &str, value: Vec<u8>, expect: Expect) -> Result<u64, StoreError>;

    /// Largest value this store accepts
    fn max_record_bytes(&self) -> usize {
        DEFAULT_MAX_RECORD_BYTES
    }
}

/// In-process store used by tests and single-node development
#[derive(Debug)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Versioned<Vec<u8>>>>,
    max_record_bytes: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_RECORD_BYTES)
    }

    pub fn with_limit(max_record_bytes: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            max_record_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        Ok(records.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>, expect: Expect) -> Result<u64, StoreError> {
        if value.len() > self.max_record_bytes {
            return Err(StoreError::TooLarge {
                key: key.to_string(),
                size: value.len(),
                limit: self.max_record_bytes,
            });
        }

        let mut records = self
            .records
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;

        let current = records.get(key).map(|r| r.version);
        let matches = match (expect, current) {
            (Expect::Any, _) => true,
            (Expect::Absent, None) => true,
            (Expect::Version(v), Some(c)) => v == c,
            _ => false,
        };
        if !matches {
            return Err(StoreError::Conflict {
                key: key.to_string(),
            });
        }

        let version = current.map_or(1, |c| c + 1);
        records.insert(key.to_string(), Versioned { value, version });
        Ok(version)
    }

    fn max_record_bytes(&self) -> usize {
        self.max_record_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_conflict_on_duplicate() {
        let store = MemoryStore::new();
        let v1 = store.put("k", b"a".to_vec(), Expect::Absent).await.unwrap();
        assert_eq!(v1, 1);

        let err = store
            .put("k", b"b".to_vec(), Expect::Absent)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_conditional_put_rejects_stale_version() {
        let store = MemoryStore::new();
        store.put("k", b"a".to_vec(), Expect::Absent).await.unwrap();
        let v2 = store
            .put("k", b"b".to_vec(), Expect::Version(1))
            .await
            .unwrap();
        assert_eq!(v2, 2);

        let err = store
            .put("k", b"c".to_vec(), Expect::Version(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let current = store.get("k").await.unwrap().unwrap();
        assert_eq!(current.value, b"b".to_vec());
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn test_version_put_on_missing_key_conflicts() {
        let store = MemoryStore::new();
        let err = store
            .put("missing", b"x".to_vec(), Expect::Version(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_record_size_ceiling() {
        let store = MemoryStore::with_limit(4);
        let err = store
            .put("k", vec![0u8; 5], Expect::Any)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TooLarge { size: 5, limit: 4, .. }));
        assert!(store.is_empty());
    }
}
