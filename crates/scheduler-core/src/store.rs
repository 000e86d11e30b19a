//! Document-store contract consumed by the write-through sink and job manager.
//!
//! The concrete transport (HTTP, in-memory, ...) is an external collaborator;
//! see `bookforge-store-client` for reference implementations.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;

/// The three mutation shapes the core ever issues against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Insert a new document; the store assigns an id.
    Create,
    /// Patch an existing document by id.
    Update,
    /// Remove a document by id.
    Delete,
}

/// A single store mutation, as queued by the sink.
#[derive(Debug, Clone)]
pub struct StoreOp {
    /// Which mutation shape this is.
    pub op_kind: OpKind,
    /// Target collection name (e.g. `"Page"`, `"Metric"`).
    pub collection: String,
    /// Document id, required for `Update`/`Delete`, ignored for `Create`.
    pub doc_id: Option<String>,
    /// The document body (ignored for `Delete`).
    pub document: Value,
    /// Free-text tag identifying the call site, for observability only.
    pub source: String,
}

impl StoreOp {
    /// Build a `Create` op.
    pub fn create(collection: impl Into<String>, document: Value, source: impl Into<String>) -> Self {
        Self {
            op_kind: OpKind::Create,
            collection: collection.into(),
            doc_id: None,
            document,
            source: source.into(),
        }
    }

    /// Build an `Update` op.
    pub fn update(
        collection: impl Into<String>,
        doc_id: impl Into<String>,
        document: Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            op_kind: OpKind::Update,
            collection: collection.into(),
            doc_id: Some(doc_id.into()),
            document,
            source: source.into(),
        }
    }

    /// Build a `Delete` op.
    pub fn delete(collection: impl Into<String>, doc_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            op_kind: OpKind::Delete,
            collection: collection.into(),
            doc_id: Some(doc_id.into()),
            document: Value::Null,
            source: source.into(),
        }
    }
}

/// Result of applying a single [`StoreOp`].
#[derive(Debug, Clone)]
pub struct StoreOpResult {
    /// The id of the affected document (assigned by `Create`, echoed otherwise).
    pub doc_id: Option<String>,
    /// Present when the op failed.
    pub err: Option<StoreError>,
}

/// Minimal document-store transport the sink and job manager build upon.
///
/// A generic `execute` covers arbitrary queries (used by job drivers to look
/// up persisted substate on resume); `apply` is the batch-mutation entry
/// point the sink calls on each flush.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run an arbitrary query/mutation document against the store, returning
    /// its raw JSON result. Used for reads the sink's op model doesn't cover.
    async fn execute(&self, query_doc: &Value, vars: &Value) -> Result<Value, StoreError>;

    /// Create a document directly (outside the batching sink), returning its
    /// assigned id. Used by the job manager for record creation, which needs
    /// the id back synchronously before `Job::start` runs.
    async fn create(&self, collection: &str, doc: &Value) -> Result<String, StoreError>;

    /// Apply a batch of ops in order, returning one result per op in the same
    /// order. A store that cannot offer per-batch atomicity should still
    /// preserve submission order in its application.
    async fn apply(&self, ops: &[StoreOp]) -> Vec<StoreOpResult>;
}
