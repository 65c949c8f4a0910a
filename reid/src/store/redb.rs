//! Redb-backed persistent record backend.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use super::{Record, RecordBackend};
use crate::error::StoreError;

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identities");

/// Records persisted in a single redb table.
pub struct RedbRecords {
    db: Database,
}

impl RedbRecords {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(|e| StoreError::Storage(e.to_string()))?;

        // Create the table so reads on a fresh file succeed.
        let tx = db
            .begin_write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        {
            let _ = tx
                .open_table(TABLE)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
        }
        tx.commit().map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(Self { db })
    }
}

impl RecordBackend for RedbRecords {
    fn load_all(&self) -> Result<Vec<(String, Record)>, StoreError> {
        let tx = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let table = tx
            .open_table(TABLE)
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        for item in table.iter().map_err(|e| StoreError::Storage(e.to_string()))? {
            let (key, value) = item.map_err(|e| StoreError::Storage(e.to_string()))?;
            results.push((key.value().to_string(), Record::decode(value.value())?));
        }
        Ok(results)
    }

    fn put(&self, key: &str, record: &Record) -> Result<(), StoreError> {
        let data = record.encode()?;
        let tx = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        {
            let mut table = tx
                .open_table(TABLE)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            table
                .insert(key, data.as_slice())
                .map_err(|e| StoreError::Storage(e.to_string()))?;
        }
        tx.commit().map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Metadata, SimilarityStore, VectorStore};
    use tempfile::tempdir;

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.redb");
        {
            let backend = RedbRecords::open(&path).unwrap();
            backend
                .put(
                    "reid_1",
                    &Record {
                        embedding: vec![0.0, 1.0],
                        metadata: Metadata::named("Bob"),
                    },
                )
                .unwrap();
        }
        let backend = RedbRecords::open(&path).unwrap();
        let all = backend.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "reid_1");
        assert_eq!(all[0].1.metadata.name, "Bob");
    }

    #[test]
    fn vector_store_over_redb() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.redb");
        {
            let store = VectorStore::open_redb(&path).unwrap();
            store.insert("reid_1", &[1.0, 0.0, 0.0], Metadata::named("Unknown_1")).unwrap();
            store.insert("reid_2", &[0.0, 1.0, 0.0], Metadata::named("Unknown_2")).unwrap();
            store
                .update_metadata(
                    "reid_2",
                    Metadata {
                        name: "Merged_to_1".into(),
                        merged_into: Some(1),
                    },
                )
                .unwrap();
        }
        let store = VectorStore::open_redb(&path).unwrap();
        assert_eq!(store.count().unwrap(), 2);
        let got = store.get("reid_2").unwrap().unwrap();
        assert_eq!(got.metadata.merged_into, Some(1));
        let hits = store.query(&[0.0, 0.0, 1.0], 5).unwrap();
        assert_eq!(hits.len(), 2);
    }
}
