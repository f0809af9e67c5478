//! In-memory document store.
//!
//! Backs tests and single-process embeddings. All operations on one store
//! are serialized by a single lock, which makes compare-and-swap atomic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::{apply_increment, DocumentStore, Filter, StoredDocument};
use crate::error::StoreError;

type Collections = HashMap<String, HashMap<String, StoredDocument>>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Collections>, StoreError> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.lock()
            .map(|c| c.get(collection).map_or(0, HashMap::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let collections = self.lock()?;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn query(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let collections = self.lock()?;
        let mut matches: Vec<StoredDocument> = collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| filter.matches(&doc.body))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }

    async fn save(&self, collection: &str, id: &str, body: Value) -> Result<u64, StoreError> {
        let mut collections = self.lock()?;
        let docs = collections.entry(collection.to_string()).or_default();
        let version = docs.get(id).map_or(0, |doc| doc.version) + 1;
        docs.insert(
            id.to_string(),
            StoredDocument {
                id: id.to_string(),
                version,
                body,
            },
        );
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        collection: &str,
        id: &str,
        body: Value,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut collections = self.lock()?;
        let docs = collections.entry(collection.to_string()).or_default();
        let actual = docs.get(id).map_or(0, |doc| doc.version);
        if actual != expected_version {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let version = actual + 1;
        docs.insert(
            id.to_string(),
            StoredDocument {
                id: id.to_string(),
                version,
                body,
            },
        );
        Ok(version)
    }

    async fn increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let mut collections = self.lock()?;
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

        let updated = apply_increment(&mut doc.body, field, delta)?;
        doc.version += 1;
        Ok(updated)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let mut collections = self.lock()?;
        Ok(collections
            .get_mut(collection)
            .map_or(false, |docs| docs.remove(id).is_some()))
    }
}
