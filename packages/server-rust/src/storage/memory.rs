//! In-memory [`EntityStore`] backed by [`DashMap`].
//!
//! Suitable for development, tests and the demo node. Records keep their
//! insertion sequence so `find` returns them in insertion order. Fields
//! declared unique are checked and written under one lock, so concurrent
//! writers cannot both claim a value.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::traits::{EntityStore, UniqueViolation};

/// In-memory record store for one entity collection.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    records: DashMap<String, (u64, Map<String, Value>)>,
    next_seq: AtomicU64,
    unique_fields: Vec<String>,
    write_lock: Mutex<()>,
}

impl MemoryEntityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects inserts and updates that would repeat a value of any of
    /// `fields` with [`UniqueViolation`].
    #[must_use]
    pub fn with_unique_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// First unique field of `candidate` whose value is held by a record
    /// other than `except_id`. Callers hold the write lock.
    fn conflicting_field(&self, candidate: &Map<String, Value>, except_id: Option<&str>) -> Option<String> {
        self.unique_fields
            .iter()
            .find(|field| {
                candidate.get(field.as_str()).filter(|v| !v.is_null()).is_some_and(|value| {
                    self.records.iter().any(|entry| {
                        Some(entry.key().as_str()) != except_id
                            && entry.value().1.get(field.as_str()) == Some(value)
                    })
                })
            })
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Every field of `filter` equals the record's field. A non-object filter
/// matches nothing; an empty object matches everything.
fn matches_filter(record: &Map<String, Value>, filter: &Value) -> bool {
    filter.as_object().is_some_and(|filter| {
        filter
            .iter()
            .all(|(field, expected)| record.get(field) == Some(expected))
    })
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn find_one(&self, filter: &Value) -> anyhow::Result<Option<Value>> {
        Ok(self.find(filter).await?.into_iter().next())
    }

    async fn find(&self, filter: &Value) -> anyhow::Result<Vec<Value>> {
        let mut hits: Vec<(u64, Map<String, Value>)> = self
            .records
            .iter()
            .filter(|entry| matches_filter(&entry.value().1, filter))
            .map(|entry| entry.value().clone())
            .collect();
        hits.sort_by_key(|(seq, _)| *seq);
        Ok(hits.into_iter().map(|(_, record)| Value::Object(record)).collect())
    }

    async fn insert(&self, record: Value) -> anyhow::Result<Value> {
        let Value::Object(mut record) = record else {
            anyhow::bail!("entity must be a JSON object");
        };
        let _guard = self.write_lock.lock();
        if let Some(field) = self.conflicting_field(&record, None) {
            return Err(UniqueViolation { field }.into());
        }
        let id = Uuid::new_v4().to_string();
        record.insert("id".to_string(), Value::String(id.clone()));
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.records.insert(id, (seq, record.clone()));
        Ok(Value::Object(record))
    }

    async fn update(&self, id: &str, patch: &Value) -> anyhow::Result<Option<Value>> {
        let patch = patch.as_object().context("patch must be a JSON object")?;
        let _guard = self.write_lock.lock();
        if let Some(field) = self.conflicting_field(patch, Some(id)) {
            return Err(UniqueViolation { field }.into());
        }
        let Some(mut entry) = self.records.get_mut(id) else {
            return Ok(None);
        };
        let record = &mut entry.value_mut().1;
        for (field, value) in patch {
            if field != "id" {
                record.insert(field.clone(), value.clone());
            }
        }
        Ok(Some(Value::Object(record.clone())))
    }

    async fn remove(&self, id: &str) -> anyhow::Result<Option<Value>> {
        Ok(self
            .records
            .remove(id)
            .map(|(_, (_, record))| Value::Object(record)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn insert_assigns_id_and_find_one_matches_fields() {
        let store = MemoryEntityStore::new();
        let ann = store
            .insert(json!({"username": "ann", "email": "a@b.com"}))
            .await
            .unwrap();
        store.insert(json!({"username": "bob", "email": "b@b.com"})).await.unwrap();

        let id = ann["id"].as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());

        let found = store.find_one(&json!({"email": "a@b.com"})).await.unwrap().unwrap();
        assert_eq!(found, ann);
        assert!(store.find_one(&json!({"email": "x@b.com"})).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_returns_insertion_order() {
        let store = MemoryEntityStore::new();
        for name in ["c", "a", "b"] {
            store.insert(json!({"username": name, "kind": "user"})).await.unwrap();
        }
        let names: Vec<String> = store
            .find(&json!({"kind": "user"}))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r["username"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(store.find(&json!({})).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn update_merges_fields_but_keeps_id() {
        let store = MemoryEntityStore::new();
        let rec = store.insert(json!({"bio": ""})).await.unwrap();
        let id = rec["id"].as_str().unwrap();

        let updated = store
            .update(id, &json!({"bio": "hi", "id": "hijack"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["bio"], "hi");
        assert_eq!(updated["id"], id);
        assert!(store.update("missing", &json!({})).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_returns_record() {
        let store = MemoryEntityStore::new();
        let rec = store.insert(json!({"a": 1})).await.unwrap();
        let id = rec["id"].as_str().unwrap();
        assert_eq!(store.remove(id).await.unwrap(), Some(rec.clone()));
        assert!(store.remove(id).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    fn violated_field(err: &anyhow::Error) -> Option<&str> {
        err.downcast_ref::<UniqueViolation>().map(|v| v.field.as_str())
    }

    #[tokio::test]
    async fn unique_fields_are_enforced_on_insert_and_update() {
        let store = MemoryEntityStore::new().with_unique_fields(["username", "email"]);
        let ann = store
            .insert(json!({"username": "ann", "email": "a@b.com"}))
            .await
            .unwrap();
        let bob = store
            .insert(json!({"username": "bob", "email": "b@b.com"}))
            .await
            .unwrap();

        let err = store
            .insert(json!({"username": "ann", "email": "c@b.com"}))
            .await
            .unwrap_err();
        assert_eq!(violated_field(&err), Some("username"));

        let bob_id = bob["id"].as_str().unwrap();
        let err = store.update(bob_id, &json!({"email": "a@b.com"})).await.unwrap_err();
        assert_eq!(violated_field(&err), Some("email"));

        // A record may keep its own value.
        let ann_id = ann["id"].as_str().unwrap();
        assert!(store.update(ann_id, &json!({"username": "ann"})).await.unwrap().is_some());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_claim_a_unique_value_once() {
        let store = Arc::new(MemoryEntityStore::new().with_unique_fields(["username"]));
        let writers: Vec<_> = (0..8)
            .map(|n| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store.insert(json!({"username": "ann", "n": n})).await.is_ok()
                })
            })
            .collect();

        let mut accepted = 0;
        for writer in writers {
            if writer.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn non_object_insert_is_rejected() {
        assert!(MemoryEntityStore::new().insert(json!([1])).await.is_err());
    }
}
