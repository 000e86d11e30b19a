//! In-memory `DocumentStore`, used by tests and standalone demos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use bookforge_scheduler_core::error::StoreError;
use bookforge_scheduler_core::store::{DocumentStore, OpKind, StoreOp, StoreOpResult};

/// A trivial document store keeping everything in a process-local map,
/// keyed by `collection/doc_id`. `execute` supports the narrow
/// `{"collection": ..., "op": "query"|"update", ...}` shape the job
/// managers and drivers in this repository issue; it is not a general
/// query engine.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: Mutex<HashMap<String, HashMap<String, Value>>>,
    next_id: AtomicU64,
}

impl InMemoryDocumentStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> String {
        format!("doc-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn execute(&self, query_doc: &Value, vars: &Value) -> Result<Value, StoreError> {
        let collection = query_doc
            .get("collection")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Invalid("query_doc missing collection".into()))?;
        let op = query_doc.get("op").and_then(Value::as_str).unwrap_or("query");
        let mut docs = self.docs.lock().expect("store mutex poisoned");
        let table = docs.entry(collection.to_string()).or_default();

        match op {
            "query" => {
                let filter = query_doc.get("filter").and_then(Value::as_object);
                let matches: Vec<Value> = table
                    .values()
                    .filter(|doc| match filter {
                        Some(filter) => filter.iter().all(|(key, expected)| doc.get(key) == Some(expected)),
                        None => true,
                    })
                    .cloned()
                    .collect();
                Ok(Value::Array(matches))
            }
            "update" => {
                let doc_id = query_doc
                    .get("doc_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StoreError::Invalid("update missing doc_id".into()))?;
                let entry = table
                    .entry(doc_id.to_string())
                    .or_insert_with(|| serde_json::json!({ "id": doc_id }));
                if let (Value::Object(entry_map), Value::Object(patch_map)) = (entry, vars) {
                    for (k, v) in patch_map {
                        entry_map.insert(k.clone(), v.clone());
                    }
                }
                Ok(Value::Null)
            }
            other => Err(StoreError::Invalid(format!("unsupported op {other:?}"))),
        }
    }

    async fn create(&self, collection: &str, doc: &Value) -> Result<String, StoreError> {
        let id = self.fresh_id();
        let mut docs = self.docs.lock().expect("store mutex poisoned");
        let mut doc = doc.clone();
        if let Value::Object(map) = &mut doc {
            map.insert("id".to_string(), Value::String(id.clone()));
        }
        docs.entry(collection.to_string()).or_default().insert(id.clone(), doc);
        Ok(id)
    }

    async fn apply(&self, ops: &[StoreOp]) -> Vec<StoreOpResult> {
        let mut docs = self.docs.lock().expect("store mutex poisoned");
        ops.iter()
            .map(|op| {
                let table = docs.entry(op.collection.clone()).or_default();
                match op.op_kind {
                    OpKind::Create => {
                        let id = self.fresh_id();
                        let mut doc = op.document.clone();
                        if let Value::Object(map) = &mut doc {
                            map.insert("id".to_string(), Value::String(id.clone()));
                        }
                        table.insert(id.clone(), doc);
                        StoreOpResult { doc_id: Some(id), err: None }
                    }
                    OpKind::Update => match &op.doc_id {
                        Some(id) => {
                            table.insert(id.clone(), op.document.clone());
                            StoreOpResult { doc_id: Some(id.clone()), err: None }
                        }
                        None => StoreOpResult {
                            doc_id: None,
                            err: Some(StoreError::Invalid("update op missing doc_id".into())),
                        },
                    },
                    OpKind::Delete => match &op.doc_id {
                        Some(id) => {
                            table.remove(id);
                            StoreOpResult { doc_id: Some(id.clone()), err: None }
                        }
                        None => StoreOpResult {
                            doc_id: None,
                            err: Some(StoreError::Invalid("delete op missing doc_id".into())),
                        },
                    },
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_query_round_trips() {
        let store = InMemoryDocumentStore::new();
        let id = store.create("Page", &serde_json::json!({"page_num": 1})).await.unwrap();
        let query = serde_json::json!({"collection": "Page", "op": "query"});
        let result = store.execute(&query, &serde_json::json!({})).await.unwrap();
        let arr = result.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["id"], id);
    }

    #[tokio::test]
    async fn apply_preserves_order_and_assigns_ids() {
        let store = InMemoryDocumentStore::new();
        let ops = vec![
            StoreOp::create("Metric", serde_json::json!({"n": 1}), "test"),
            StoreOp::create("Metric", serde_json::json!({"n": 2}), "test"),
        ];
        let results = store.apply(&ops).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].doc_id.is_some());
        assert!(results[1].doc_id.is_some());
        assert_ne!(results[0].doc_id, results[1].doc_id);
    }
}
