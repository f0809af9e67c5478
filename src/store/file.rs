//! File-backed document store.
//!
//! Each document is saved to `{root}/{collection}/{id}.json` together with
//! its version, so instances survive a process restart and can be
//! recovered. Writes go to a temporary file first and are renamed into
//! place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;

use super::{apply_increment, DocumentStore, Filter, StoredDocument};
use crate::error::StoreError;

pub struct FileStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        info!("Using document store at {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(encode_name(collection))
    }

    fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{}.json", encode_name(id)))
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let path = self.document_path(collection, id);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, collection: &str, doc: &StoredDocument) -> Result<(), StoreError> {
        let dir = self.collection_dir(collection);
        fs::create_dir_all(&dir).await?;

        let path = self.document_path(collection, &doc.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(doc)?).await?;
        fs::rename(&tmp, &path).await?;

        debug!("Saved {}/{} at version {}", collection, doc.id, doc.version);
        Ok(())
    }
}

/// Maps an id onto a file name, percent-escaping every byte outside
/// `[A-Za-z0-9_-]`. Distinct ids always map to distinct names.
fn encode_name(id: &str) -> String {
    let mut name = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        self.read(collection, id).await
    }

    async fn query(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let dir = self.collection_dir(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut matches = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            let doc: StoredDocument = serde_json::from_str(&content)?;
            if filter.matches(&doc.body) {
                matches.push(doc);
            }
        }
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }

    async fn save(&self, collection: &str, id: &str, body: Value) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let version = self.read(collection, id).await?.map_or(0, |d| d.version) + 1;
        let doc = StoredDocument {
            id: id.to_string(),
            version,
            body,
        };
        self.write(collection, &doc).await?;
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        collection: &str,
        id: &str,
        body: Value,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let actual = self.read(collection, id).await?.map_or(0, |d| d.version);
        if actual != expected_version {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let doc = StoredDocument {
            id: id.to_string(),
            version: actual + 1,
            body,
        };
        self.write(collection, &doc).await?;
        Ok(doc.version)
    }

    async fn increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self
            .read(collection, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

        let updated = apply_increment(&mut doc.body, field, delta)?;
        doc.version += 1;
        self.write(collection, &doc).await?;
        Ok(updated)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.document_path(collection, id)).await {
            Ok(()) => {
                info!("Deleted {}/{}", collection, id);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_and_reopen() {
        let temp_dir = tempdir().unwrap();
        {
            let store = FileStore::open(temp_dir.path()).await.unwrap();
            store.save("instances", "i-1", json!({"status": "active"})).await.unwrap();
            store.save("instances", "i-1", json!({"status": "completed"})).await.unwrap();
        }

        let store = FileStore::open(temp_dir.path()).await.unwrap();
        let doc = store.get("instances", "i-1").await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.body["status"], "completed");
        assert!(temp_dir.path().join("instances").join("i-1.json").exists());
    }

    #[tokio::test]
    async fn test_compare_and_swap_conflict() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();

        assert_eq!(store.compare_and_swap("c", "a", json!({}), 0).await.unwrap(), 1);
        let err = store
            .compare_and_swap("c", "a", json!({}), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { actual: 1, .. }));
    }

    #[tokio::test]
    async fn test_query_filters_and_skips_missing_collection() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        assert!(store.query("nothing", &Filter::new()).await.unwrap().is_empty());

        store.save("i", "a", json!({"workflow_id": "wf"})).await.unwrap();
        store.save("i", "b", json!({"workflow_id": "other"})).await.unwrap();
        let found = store
            .query("i", &Filter::new().eq("workflow_id", "wf"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }

    #[tokio::test]
    async fn test_increment_and_delete() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        store.save("subjects", "post/1", json!({})).await.unwrap();

        assert_eq!(store.increment("subjects", "post/1", "version", 1).await.unwrap(), 1);
        assert_eq!(store.increment("subjects", "post/1", "version", 1).await.unwrap(), 2);
        assert!(store.delete("subjects", "post/1").await.unwrap());
        assert!(store.get("subjects", "post/1").await.unwrap().is_none());
    }

    #[test]
    fn test_encode_name() {
        assert_eq!(encode_name("post/1"), "post%2F1");
        assert_eq!(encode_name("post_1"), "post_1");
        assert_eq!(encode_name("a-b.c"), "a-b%2Ec");
        assert_eq!(encode_name("100%"), "100%25");
        assert_eq!(encode_name(".."), "%2E%2E");
    }

    #[tokio::test]
    async fn test_ids_differing_in_unsafe_characters_stay_separate() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();

        store.save("subjects", "post/1", json!({"title": "slash"})).await.unwrap();
        store.save("subjects", "post_1", json!({"title": "underscore"})).await.unwrap();

        let slash = store.get("subjects", "post/1").await.unwrap().unwrap();
        assert_eq!(slash.id, "post/1");
        assert_eq!(slash.version, 1);
        assert_eq!(slash.body["title"], "slash");

        let underscore = store.get("subjects", "post_1").await.unwrap().unwrap();
        assert_eq!(underscore.body["title"], "underscore");
        assert_eq!(store.query("subjects", &Filter::new()).await.unwrap().len(), 2);
    }
}
