//! Document Store
//!
//! The engine's only shared mutable resource. Every document carries a
//! monotonically increasing version; writes that must not clobber a
//! concurrent update go through [`DocumentStore::compare_and_swap`].
//!
//! # Components
//!
//! - [`DocumentStore`]: the collaborator interface (raw JSON documents)
//! - [`Repository`]: typed access on top of a store
//! - [`MemoryStore`]: in-process implementation
//! - [`FileStore`]: one JSON file per document

pub mod file;
pub mod memory;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::workflow::{WorkflowDefinition, WorkflowInstance};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Collection holding workflow definitions.
pub const WORKFLOWS: &str = "workflows";
/// Collection holding workflow instances.
pub const INSTANCES: &str = "instances";
/// Collection holding governed content objects.
pub const SUBJECTS: &str = "subjects";
/// Collection holding content version snapshots.
pub const VERSIONS: &str = "content_versions";
/// Collection holding A/B tests.
pub const AB_TESTS: &str = "ab_tests";

/// A stored JSON document with its version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub version: u64,
    pub body: Value,
}

/// Equality filter over top-level or dotted fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `field` (dot-separated path) to equal `value`.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, body: &Value) -> bool {
        self.conditions.iter().all(|(field, expected)| {
            field
                .split('.')
                .try_fold(body, |current, key| current.get(key))
                .map_or(expected.is_null(), |actual| actual == expected)
        })
    }
}

/// Persistence interface consumed by the engine.
///
/// Versions start at 1 for a freshly written document. An expected version
/// of 0 in [`compare_and_swap`](Self::compare_and_swap) means "must not exist".
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError>;

    async fn query(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// Unconditional upsert. Returns the new version.
    async fn save(&self, collection: &str, id: &str, body: Value) -> Result<u64, StoreError>;

    /// Writes only if the stored version equals `expected_version`.
    ///
    /// Returns the new version, or [`StoreError::Conflict`].
    async fn compare_and_swap(
        &self,
        collection: &str,
        id: &str,
        body: Value,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Atomically adds `delta` to a numeric field and returns the new value.
    ///
    /// A missing field counts as 0; a missing document is an error.
    async fn increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError>;

    /// Removes a document. Returns whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;
}

/// Adds `delta` to the numeric `field` of an object body.
pub(crate) fn apply_increment(body: &mut Value, field: &str, delta: i64) -> Result<i64, StoreError> {
    let map = body
        .as_object_mut()
        .ok_or_else(|| StoreError::Backend(format!("Cannot increment '{}' on a non-object", field)))?;
    let current = match map.get(field) {
        None | Some(Value::Null) => 0,
        Some(value) => value.as_i64().ok_or_else(|| {
            StoreError::Backend(format!("Field '{}' is not an integer", field))
        })?,
    };
    let updated = current.checked_add(delta).ok_or_else(|| {
        StoreError::Backend(format!("Incrementing '{}' by {} overflows", field, delta))
    })?;
    map.insert(field.to_string(), Value::from(updated));
    Ok(updated)
}

/// A value stored in a collection of its own.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
}

impl Document for WorkflowDefinition {
    const COLLECTION: &'static str = WORKFLOWS;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Document for WorkflowInstance {
    const COLLECTION: &'static str = INSTANCES;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A typed document together with the store version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Typed access to one collection.
pub struct Repository<T> {
    store: Arc<dyn DocumentStore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _marker: PhantomData,
        }
    }
}

impl<T: Document> Repository<T> {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    fn decode(doc: StoredDocument) -> Result<Versioned<T>, StoreError> {
        Ok(Versioned {
            version: doc.version,
            value: serde_json::from_value(doc.body)?,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<Versioned<T>>, StoreError> {
        match self.store.get(T::COLLECTION, id).await? {
            Some(doc) => Ok(Some(Self::decode(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn query(&self, filter: &Filter) -> Result<Vec<Versioned<T>>, StoreError> {
        self.store
            .query(T::COLLECTION, filter)
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    /// Unconditional write.
    pub async fn save(&self, value: T) -> Result<Versioned<T>, StoreError> {
        let body = serde_json::to_value(&value)?;
        let version = self.store.save(T::COLLECTION, value.id(), body).await?;
        Ok(Versioned { version, value })
    }

    /// Writes a document that must not exist yet.
    pub async fn insert(&self, value: T) -> Result<Versioned<T>, StoreError> {
        let body = serde_json::to_value(&value)?;
        let version = self
            .store
            .compare_and_swap(T::COLLECTION, value.id(), body, 0)
            .await?;
        Ok(Versioned { version, value })
    }

    /// Writes `doc` if nobody else has since the version it carries,
    /// then advances its version.
    pub async fn update(&self, doc: &mut Versioned<T>) -> Result<(), StoreError> {
        let body = serde_json::to_value(&doc.value)?;
        doc.version = self
            .store
            .compare_and_swap(T::COLLECTION, doc.value.id(), body, doc.version)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.store.delete(T::COLLECTION, id).await
    }
}
