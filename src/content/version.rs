//! Content Versions
//!
//! Immutable snapshots of what changed on a subject, numbered per subject.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::{Document, VERSIONS};

/// Before and after values of one field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

impl FieldChange {
    pub fn new(old: Value, new: Value) -> Self {
        Self { old, new }
    }
}

/// Field name to change.
pub type Changes = BTreeMap<String, FieldChange>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContentVersion {
    pub id: String,

    pub subject_id: String,

    /// 1-based, allocated atomically per subject
    pub number: i64,

    pub actor: String,

    pub changes: Changes,

    #[serde(default)]
    pub description: String,

    pub timestamp: DateTime<Utc>,
}

impl ContentVersion {
    pub fn new(
        subject_id: impl Into<String>,
        number: i64,
        actor: impl Into<String>,
        changes: Changes,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            number,
            actor: actor.into(),
            changes,
            description: description.into(),
            timestamp: Utc::now(),
        }
    }
}

impl Document for ContentVersion {
    const COLLECTION: &'static str = VERSIONS;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Diffs the fields of `patch` against `current`.
///
/// Only fields accepted by `tracked` are compared; unchanged fields are
/// left out. A field absent from `current` has an old value of `null`.
pub fn diff_fields(current: &Value, patch: &Value, tracked: impl Fn(&str) -> bool) -> Changes {
    let Some(fields) = patch.as_object() else {
        return Changes::new();
    };

    fields
        .iter()
        .filter(|(name, _)| tracked(name))
        .filter_map(|(name, new)| {
            let old = current.get(name).cloned().unwrap_or(Value::Null);
            (old != *new).then(|| (name.clone(), FieldChange::new(old, new.clone())))
        })
        .collect()
}

/// Applies `patch` on top of `current` (top-level fields only).
pub fn apply_patch(current: &Value, patch: &Value) -> Value {
    let mut merged = current.as_object().cloned().unwrap_or_default();
    if let Some(fields) = patch.as_object() {
        for (name, value) in fields {
            merged.insert(name.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_ignores_unchanged_and_untracked() {
        let current = json!({"title": "Draft", "body": "Hello", "views": 10});
        let patch = json!({"title": "Final", "body": "Hello", "views": 11, "slug": "final"});

        let changes = diff_fields(&current, &patch, |f| f != "views");
        assert_eq!(changes.len(), 2);
        assert_eq!(changes["title"], FieldChange::new(json!("Draft"), json!("Final")));
        assert_eq!(changes["slug"].old, Value::Null);
        assert!(!changes.contains_key("body"));
    }

    #[test]
    fn test_diff_non_object_patch() {
        assert!(diff_fields(&json!({}), &json!("oops"), |_| true).is_empty());
    }

    #[test]
    fn test_apply_patch() {
        let merged = apply_patch(&json!({"a": 1, "b": 2}), &json!({"b": 3, "c": 4}));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_version_serialization() {
        let mut changes = Changes::new();
        changes.insert("title".to_string(), FieldChange::new(json!("a"), json!("b")));
        let version = ContentVersion::new("post-1", 3, "ana", changes, "retitle");

        let value = serde_json::to_value(&version).unwrap();
        assert_eq!(value["number"], 3);
        assert_eq!(value["changes"]["title"]["new"], "b");
        let back: ContentVersion = serde_json::from_value(value).unwrap();
        assert_eq!(back, version);
    }
}
