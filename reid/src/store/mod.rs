//! Durable identity storage with nearest-neighbor lookup.
//!
//! [`SimilarityStore`] is the seam the registry talks to. [`VectorStore`] is
//! the bundled implementation: a brute-force [`FlatIndex`] kept in memory,
//! rebuilt on open from a [`RecordBackend`] that persists one
//! msgpack-encoded [`Record`] per identity key.

mod memory;
mod redb;

pub use memory::MemoryRecords;
pub use self::redb::RedbRecords;

use std::collections::HashMap;
use std::path::Path;

use gazer_vecstore::{FlatIndex, VecIndex, similarity_from_l2};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;

/// Per-identity metadata kept next to the embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,

    /// Survivor's ReID number once this identity has been merged away.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<u64>,
}

impl Metadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            merged_into: None,
        }
    }
}

/// One query hit.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreMatch {
    pub key: String,

    /// L2 distance between unit vectors, in `[0, 2]`.
    pub distance: f32,

    pub metadata: Metadata,
}

impl StoreMatch {
    /// Cosine similarity implied by the distance.
    pub fn similarity(&self) -> f32 {
        similarity_from_l2(self.distance)
    }
}

/// A stored identity with its (normalized) embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredIdentity {
    pub key: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

/// Persistent key → (embedding, metadata) map with nearest-neighbor query.
///
/// All implementations must be safe for concurrent use.
pub trait SimilarityStore: Send + Sync {
    /// Up to `k` nearest identities, ascending distance.
    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<StoreMatch>, StoreError>;

    /// Adds a new identity. Fails with [`StoreError::Duplicate`] if `key`
    /// is taken.
    fn insert(&self, key: &str, vector: &[f32], metadata: Metadata) -> Result<(), StoreError>;

    /// Replaces the metadata of an existing identity.
    fn update_metadata(&self, key: &str, metadata: Metadata) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<StoredIdentity>, StoreError>;

    /// Every stored identity, ordered by key.
    fn entries(&self) -> Result<Vec<StoredIdentity>, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;
}

/// The persisted form of one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

impl Record {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, StoreError> {
        rmp_serde::from_slice(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// Where [`VectorStore`] keeps its records.
pub trait RecordBackend: Send + Sync {
    /// Every record, ordered by key.
    fn load_all(&self) -> Result<Vec<(String, Record)>, StoreError>;

    /// Inserts or replaces the record under `key`.
    fn put(&self, key: &str, record: &Record) -> Result<(), StoreError>;
}

/// [`SimilarityStore`] over a [`FlatIndex`] and a [`RecordBackend`].
pub struct VectorStore {
    index: FlatIndex,
    metadata: RwLock<HashMap<String, Metadata>>,
    backend: Box<dyn RecordBackend>,
}

impl VectorStore {
    /// Opens a store over `backend`, loading every record into the index.
    ///
    /// Records that cannot be indexed (zero vectors, wrong dimension) are
    /// skipped with a warning.
    pub fn open(backend: Box<dyn RecordBackend>) -> Result<Self, StoreError> {
        let index = FlatIndex::new();
        let mut metadata = HashMap::new();
        for (key, record) in backend.load_all()? {
            if let Err(e) = index.insert(&key, &record.embedding) {
                warn!(key = %key, error = %e, "skipping unindexable record");
                continue;
            }
            metadata.insert(key, record.metadata);
        }
        debug!(count = metadata.len(), "vector store loaded");
        Ok(Self {
            index,
            metadata: RwLock::new(metadata),
            backend,
        })
    }

    /// A store that forgets everything on drop.
    pub fn in_memory() -> Self {
        Self {
            index: FlatIndex::new(),
            metadata: RwLock::new(HashMap::new()),
            backend: Box::new(MemoryRecords::new()),
        }
    }

    /// Opens or creates a redb-backed store at `path`.
    pub fn open_redb<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open(Box::new(RedbRecords::open(path)?))
    }
}

impl SimilarityStore for VectorStore {
    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<StoreMatch>, StoreError> {
        let hits = self.index.search(vector, k)?;
        let metadata = self.metadata.read();
        Ok(hits
            .into_iter()
            .filter_map(|m| {
                let md = metadata.get(&m.id)?.clone();
                Some(StoreMatch {
                    key: m.id,
                    distance: m.distance,
                    metadata: md,
                })
            })
            .collect())
    }

    fn insert(&self, key: &str, vector: &[f32], metadata: Metadata) -> Result<(), StoreError> {
        let mut all = self.metadata.write();
        if all.contains_key(key) {
            return Err(StoreError::Duplicate(key.to_string()));
        }
        self.index.insert(key, vector)?;
        let embedding = self.index.get(key).unwrap_or_else(|| vector.to_vec());
        let record = Record {
            embedding,
            metadata: metadata.clone(),
        };
        if let Err(e) = self.backend.put(key, &record) {
            self.index.delete(key);
            return Err(e);
        }
        all.insert(key.to_string(), metadata);
        Ok(())
    }

    fn update_metadata(&self, key: &str, metadata: Metadata) -> Result<(), StoreError> {
        let mut all = self.metadata.write();
        if !all.contains_key(key) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let embedding = self
            .index
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        self.backend.put(
            key,
            &Record {
                embedding,
                metadata: metadata.clone(),
            },
        )?;
        all.insert(key.to_string(), metadata);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StoredIdentity>, StoreError> {
        let metadata = match self.metadata.read().get(key) {
            Some(md) => md.clone(),
            None => return Ok(None),
        };
        Ok(self.index.get(key).map(|embedding| StoredIdentity {
            key: key.to_string(),
            embedding,
            metadata,
        }))
    }

    fn entries(&self) -> Result<Vec<StoredIdentity>, StoreError> {
        let metadata = self.metadata.read();
        Ok(self
            .index
            .entries()
            .into_iter()
            .filter_map(|(key, embedding)| {
                let md = metadata.get(&key)?.clone();
                Some(StoredIdentity {
                    key,
                    embedding,
                    metadata: md,
                })
            })
            .collect())
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.metadata.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_encoding() {
        let rec = Record {
            embedding: vec![0.6, 0.8],
            metadata: Metadata {
                name: "Merged_to_3".into(),
                merged_into: Some(3),
            },
        };
        let data = rec.encode().unwrap();
        assert_eq!(Record::decode(&data).unwrap(), rec);
        assert!(Record::decode(b"\xc1garbage").is_err());
    }

    #[test]
    fn query_ranks_by_distance() {
        let store = VectorStore::in_memory();
        store.insert("reid_1", &[1.0, 0.0, 0.0], Metadata::named("a")).unwrap();
        store.insert("reid_2", &[0.0, 1.0, 0.0], Metadata::named("b")).unwrap();
        store.insert("reid_3", &[0.8, 0.6, 0.0], Metadata::named("c")).unwrap();

        let hits = store.query(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].key, "reid_1");
        assert!((hits[0].similarity() - 1.0).abs() < 1e-5);
        assert_eq!(hits[1].key, "reid_3");
        assert!((hits[1].similarity() - 0.8).abs() < 1e-5);
        assert_eq!(hits[1].metadata.name, "c");
    }

    #[test]
    fn query_on_empty_store() {
        let store = VectorStore::in_memory();
        assert!(store.query(&[1.0, 0.0], 3).unwrap().is_empty());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn insert_rejects_duplicate_key() {
        let store = VectorStore::in_memory();
        store.insert("reid_1", &[1.0, 0.0], Metadata::named("a")).unwrap();
        let err = store.insert("reid_1", &[0.0, 1.0], Metadata::named("b"));
        assert!(matches!(err, Err(StoreError::Duplicate(_))));
        // The first vector is untouched.
        let got = store.get("reid_1").unwrap().unwrap();
        assert_eq!(got.metadata.name, "a");
        assert!((got.embedding[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn insert_rejects_bad_vectors() {
        let store = VectorStore::in_memory();
        assert!(matches!(
            store.insert("reid_1", &[0.0, 0.0], Metadata::named("a")),
            Err(StoreError::Vector(_))
        ));
        store.insert("reid_1", &[1.0, 0.0], Metadata::named("a")).unwrap();
        assert!(matches!(
            store.insert("reid_2", &[1.0, 0.0, 0.0], Metadata::named("b")),
            Err(StoreError::Vector(_))
        ));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn update_metadata() {
        let store = VectorStore::in_memory();
        store.insert("reid_1", &[1.0, 0.0], Metadata::named("Unknown_1")).unwrap();
        store.update_metadata("reid_1", Metadata::named("Alice")).unwrap();
        assert_eq!(store.get("reid_1").unwrap().unwrap().metadata.name, "Alice");

        let err = store.update_metadata("reid_9", Metadata::named("x"));
        assert!(matches!(err, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn entries_are_key_ordered() {
        let store = VectorStore::in_memory();
        store.insert("reid_2", &[0.0, 1.0], Metadata::named("b")).unwrap();
        store.insert("reid_1", &[1.0, 0.0], Metadata::named("a")).unwrap();
        let keys: Vec<String> = store.entries().unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["reid_1", "reid_2"]);
    }

    #[test]
    fn reopen_rebuilds_index() {
        let backend = MemoryRecords::new();
        {
            let store = VectorStore::open(Box::new(backend.clone())).unwrap();
            store.insert("reid_1", &[3.0, 4.0], Metadata::named("a")).unwrap();
            store.update_metadata("reid_1", Metadata::named("Alice")).unwrap();
        }
        let store = VectorStore::open(Box::new(backend)).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        let hits = store.query(&[0.6, 0.8], 1).unwrap();
        assert_eq!(hits[0].key, "reid_1");
        assert_eq!(hits[0].metadata.name, "Alice");
    }
}
