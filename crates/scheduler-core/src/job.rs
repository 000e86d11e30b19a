//! Job contract, persisted record shape, and shared bookkeeping helpers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sink::Sink;
use crate::store::DocumentStore;
use crate::types::{WorkResult, WorkUnit};

/// Status of a persisted job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Record created, not yet started.
    Queued,
    /// `start` has run; work units may still be outstanding.
    Running,
    /// `done()` held with zero pending units.
    Completed,
    /// `start` or `on_complete` returned an error.
    Failed,
    /// The job was cancelled before completion.
    Cancelled,
}

/// A job record as persisted in the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Store-assigned id, empty until the manager creates the record.
    pub id: String,
    /// Job type name, used to look up a resume factory.
    pub job_type: String,
    /// Owning book id, if any.
    pub book_id: Option<String>,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// First `start` timestamp.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal timestamp (Completed/Failed/Cancelled).
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error text, set only for `Failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Opaque metadata the factory needs to rebuild the job on resume.
    pub metadata: HashMap<String, Value>,
}

impl JobRecord {
    /// Build a fresh, unpersisted record for `job_type`.
    pub fn new(job_type: impl Into<String>, book_id: Option<String>) -> Self {
        let mut metadata = HashMap::new();
        if let Some(book_id) = &book_id {
            metadata.insert("book_id".to_string(), Value::String(book_id.clone()));
        }
        Self {
            id: String::new(),
            job_type: job_type.into(),
            book_id,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            metadata,
        }
    }
}

/// Per-job services injected by the scheduler before `start`/`on_complete`.
///
/// Jobs must not capture these at construction time: a resumed job is
/// rebuilt by its factory without services in hand, and the scheduler
/// injects them fresh on every call.
#[derive(Clone)]
pub struct JobContext {
    /// Document store, for direct reads job drivers need (e.g. resume lookups).
    pub store: Arc<dyn DocumentStore>,
    /// Write-through sink, for persisting progress.
    pub sink: Arc<Sink>,
    /// Home directory for on-disk artifacts (originals, source images, audio).
    pub home_dir: std::path::PathBuf,
}

/// Bookkeeping a job keeps per pending work unit: sub-type, retry count, and
/// any job-specific keys (page number, chapter id) needed to interpret the
/// eventual result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingUnitInfo {
    /// Free-form sub-type tag (e.g. "extract_page", "ocr", "segment").
    pub sub_type: String,
    /// Page number, for page-scoped units.
    pub page_num: Option<u32>,
    /// Chapter document id, for chapter-scoped units.
    pub chapter_id: Option<String>,
    /// Retry attempts already charged against the job-level budget.
    pub retry_count: u32,
}

/// Tracks which work-unit ids are still outstanding for a job.
///
/// Shared helper so every job driver doesn't reimplement the same map.
#[derive(Debug, Clone, Default)]
pub struct WorkUnitTracker {
    pending: HashMap<String, PendingUnitInfo>,
}

impl WorkUnitTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly-enqueued unit.
    pub fn track(&mut self, unit: &WorkUnit, info: PendingUnitInfo) {
        self.pending.insert(unit.id.clone(), info);
    }

    /// Remove and return the bookkeeping for a completed unit's id.
    pub fn complete(&mut self, work_unit_id: &str) -> Option<PendingUnitInfo> {
        self.pending.remove(work_unit_id)
    }

    /// Number of units still outstanding.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when no units are outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Per-page OCR state, shared by the OCR job driver and its persisted layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    /// The page image has not been extracted from the source PDF yet.
    ImageAbsent,
    /// The page image is on disk; OCR has not started.
    ImagePresent,
    /// At least one OCR provider call is outstanding for this page.
    OcrInProgress,
    /// Every configured provider has produced a result for this page.
    OcrComplete,
}

/// Per-chapter TTS progress, shared by the TTS job driver and its persisted layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterAudioState {
    /// No segment has started yet.
    Pending,
    /// At least one segment request is outstanding.
    SegmentInProgress,
    /// All segments are on disk; concatenation has not run.
    SegmentsDone,
    /// The chapter's segments have been joined into one audio file.
    Concatenated,
    /// A non-retriable failure occurred; absorbing.
    Failed,
}

/// Book-level audio generation status, persisted as the `BookAudio` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookAudioState {
    /// At least one chapter is still generating.
    Generating,
    /// Every chapter has been concatenated.
    Complete,
    /// A fatal error stopped generation.
    Failed,
}

/// The contract every job type implements.
///
/// `start`/`on_complete` are called from the scheduler's single
/// result-processor task: never concurrently for the same job, and never
/// concurrently with each other. Implementers should hold all mutable state
/// behind one mutex and return new units rather than calling back into the
/// scheduler directly.
#[async_trait]
pub trait Job: Send + Sync {
    /// Assigns the persisted record id, called once immediately after the
    /// scheduler creates the record.
    fn set_record_id(&self, id: String);

    /// The record id assigned by [`Job::set_record_id`], if any.
    fn record_id(&self) -> Option<String>;

    /// Job type name, used for the persisted record and resume factory lookup.
    fn job_type(&self) -> String;

    /// Owning book id, if any, persisted into the record's metadata.
    fn book_id(&self) -> Option<String> {
        None
    }

    /// Produce the initial frontier of work units. May return an empty
    /// vector and report `done() == true` for a synchronous job.
    async fn start(&self, ctx: &JobContext) -> Result<Vec<WorkUnit>, String>;

    /// Consume one result and return any newly-produced work units. Errors
    /// are terminal for the job: the scheduler marks the record failed.
    async fn on_complete(&self, ctx: &JobContext, result: WorkResult) -> Result<Vec<WorkUnit>, String>;

    /// Whether the job considers its own work exhausted. The scheduler only
    /// finalizes the job when this holds *and* no units are pending.
    fn done(&self) -> bool;

    /// Current pending-unit count, surfaced through `job_status`.
    fn pending_count(&self) -> usize;

    /// Per-provider progress map, surfaced through `job_progress`.
    fn progress(&self) -> HashMap<String, Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_tracks_and_completes() {
        let mut tracker = WorkUnitTracker::new();
        let unit = WorkUnit::new(
            10,
            crate::types::WorkPayload::Cpu(crate::types::CpuRequest {
                task: "noop".into(),
                data: Value::Null,
            }),
        );
        tracker.track(&unit, PendingUnitInfo { sub_type: "noop".into(), ..Default::default() });
        assert_eq!(tracker.len(), 1);
        let info = tracker.complete(&unit.id).unwrap();
        assert_eq!(info.sub_type, "noop");
        assert!(tracker.is_empty());
    }

    #[test]
    fn job_record_carries_book_id_into_metadata() {
        let record = JobRecord::new("ocr", Some("book-1".into()));
        assert_eq!(record.metadata.get("book_id").unwrap(), "book-1");
        assert_eq!(record.status, JobStatus::Queued);
    }

    #[test]
    fn record_missing_optional_timestamps_still_deserializes() {
        // Mirrors the document `StoreJobManager::create` actually writes: no
        // `started_at`/`completed_at`/`error` keys at all until the record
        // transitions. `list_running` must not silently drop these.
        let doc = serde_json::json!({
            "id": "job-1",
            "job_type": "ocr",
            "book_id": "book-1",
            "status": "running",
            "created_at": Utc::now(),
            "metadata": {},
        });
        let record: JobRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert!(record.started_at.is_none());
        assert!(record.completed_at.is_none());
        assert!(record.error.is_none());
    }
}
