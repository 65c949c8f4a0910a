//! In-memory record backend for tests and ephemeral sessions.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Record, RecordBackend};
use crate::error::StoreError;

/// Encoded records in a shared map. Clones see the same data, so a test
/// can reopen a [`VectorStore`](super::VectorStore) over the same records.
#[derive(Clone, Default)]
pub struct MemoryRecords {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordBackend for MemoryRecords {
    fn load_all(&self) -> Result<Vec<(String, Record)>, StoreError> {
        let data = self.data.lock();
        data.iter()
            .map(|(k, v)| Ok((k.clone(), Record::decode(v)?)))
            .collect()
    }

    fn put(&self, key: &str, record: &Record) -> Result<(), StoreError> {
        let bytes = record.encode()?;
        self.data.lock().insert(key.to_string(), bytes);
        Ok(())
    }
}
