//! CRUD of job records against the document store.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::error::StoreError;
use crate::job::{JobRecord, JobStatus};
use crate::store::DocumentStore;

const COLLECTION: &str = "Job";

/// Persists and transitions [`JobRecord`]s.
///
/// A thin layer over [`DocumentStore`]; kept as its own trait so a job-heavy
/// deployment can swap in a differently-indexed implementation without
/// touching the scheduler.
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Create a new record, returning it with its assigned id.
    async fn create(&self, record: JobRecord) -> Result<JobRecord, StoreError>;

    /// Patch a record's status, and error text for `Failed`.
    async fn set_status(&self, id: &str, status: JobStatus, error: Option<String>) -> Result<(), StoreError>;

    /// List every record currently `Running`, for [`crate::scheduler::Scheduler::resume`].
    async fn list_running(&self) -> Result<Vec<JobRecord>, StoreError>;
}

/// [`JobManager`] built directly over a [`DocumentStore`].
pub struct StoreJobManager {
    store: std::sync::Arc<dyn DocumentStore>,
}

impl StoreJobManager {
    /// Wrap `store` as a job manager.
    pub fn new(store: std::sync::Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobManager for StoreJobManager {
    async fn create(&self, mut record: JobRecord) -> Result<JobRecord, StoreError> {
        let doc = json!({
            "job_type": record.job_type,
            "book_id": record.book_id,
            "status": record.status,
            "created_at": record.created_at,
            "metadata": record.metadata,
        });
        let id = self.store.create(COLLECTION, &doc).await?;
        record.id = id;
        Ok(record)
    }

    async fn set_status(&self, id: &str, status: JobStatus, error: Option<String>) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut patch = json!({ "status": status });
        match status {
            JobStatus::Running => patch["started_at"] = json!(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                patch["completed_at"] = json!(now);
                patch["error"] = json!(error);
            }
            JobStatus::Queued => {}
        }
        let query = json!({ "collection": COLLECTION, "op": "update", "doc_id": id });
        self.store.execute(&query, &patch).await.map(|_| ())
    }

    async fn list_running(&self) -> Result<Vec<JobRecord>, StoreError> {
        let query = json!({ "collection": COLLECTION, "op": "query", "filter": { "status": "running" } });
        let value = self.store.execute(&query, &json!({})).await?;
        let records: Vec<JobRecord> = serde_json::from_value(value).unwrap_or_default();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreOp, StoreOpResult};
    use serde_json::Value;
    use std::sync::Mutex;

    struct FakeStore {
        created: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl DocumentStore for FakeStore {
        async fn execute(&self, _query_doc: &Value, _vars: &Value) -> Result<Value, StoreError> {
            Ok(json!([]))
        }
        async fn create(&self, collection: &str, doc: &Value) -> Result<String, StoreError> {
            self.created.lock().unwrap().push((collection.to_string(), doc.clone()));
            Ok("job-1".into())
        }
        async fn apply(&self, _ops: &[StoreOp]) -> Vec<StoreOpResult> {
            vec![]
        }
    }

    #[tokio::test]
    async fn create_assigns_id_from_store() {
        let store = std::sync::Arc::new(FakeStore { created: Mutex::new(vec![]) });
        let manager = StoreJobManager::new(store.clone());
        let record = JobRecord::new("ingest", Some("book-1".into()));
        let created = manager.create(record).await.unwrap();
        assert_eq!(created.id, "job-1");
        assert_eq!(store.created.lock().unwrap().len(), 1);
    }
}
