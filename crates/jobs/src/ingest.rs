//! Synchronous ingest driver: stage a source PDF, count its pages, persist a
//! `Book` record, and finish without emitting any work units.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use ulid::Ulid;

use bookforge_scheduler_core::job::{Job, JobContext};
use bookforge_scheduler_core::store::StoreOp;
use bookforge_scheduler_core::types::{WorkResult, WorkUnit};
use bookforge_store_client::records::Book;

use crate::error::JobDriverError;

/// Counts pages in a source PDF. Stubbed behind a trait so a real PDF
/// library (`lopdf`, `pdfium-render`, ...) can be dropped in without
/// touching the driver.
pub trait PageCounter: Send + Sync {
    /// Read `path` and report its page count.
    fn count_pages(&self, path: &Path) -> Result<u32, JobDriverError>;
}

/// Naive reference counter: scans raw PDF bytes for `/Type/Page` object
/// markers. Works for simple, uncompressed PDFs; not a substitute for a
/// real parser, which is why it lives behind [`PageCounter`].
pub struct NaivePageCounter;

impl PageCounter for NaivePageCounter {
    fn count_pages(&self, path: &Path) -> Result<u32, JobDriverError> {
        let bytes = std::fs::read(path).map_err(|e| JobDriverError::Io(e.to_string()))?;
        let count = bytes.windows(10).filter(|w| *w == b"/Type/Page").count()
            + bytes.windows(11).filter(|w| *w == b"/Type /Page").count();
        if count == 0 {
            return Err(JobDriverError::InvalidSource(
                "no page objects found in source PDF".into(),
            ));
        }
        Ok(count as u32)
    }
}

#[derive(Default)]
struct State {
    record_id: Option<String>,
    book_id: Option<String>,
}

/// Ingests exactly one source PDF into a new `Book`.
///
/// `start` does all of its work inline and returns no units; it is the
/// reference example of the synchronous-completion path.
pub struct IngestJob {
    state: Mutex<State>,
    done: AtomicBool,
    source_path: PathBuf,
    title: Option<String>,
    page_counter: Arc<dyn PageCounter>,
}

impl IngestJob {
    /// Build an ingest job for `source_path`, with an optional display title
    /// (defaulting to the file stem) and a [`PageCounter`].
    pub fn new(source_path: PathBuf, title: Option<String>, page_counter: Arc<dyn PageCounter>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            done: AtomicBool::new(false),
            source_path,
            title,
            page_counter,
        }
    }

    /// Build an ingest job using the bundled [`NaivePageCounter`].
    pub fn with_default_counter(source_path: PathBuf, title: Option<String>) -> Self {
        Self::new(source_path, title, Arc::new(NaivePageCounter))
    }

    /// The id of the `Book` created by a completed run, if any.
    pub fn book_id_result(&self) -> Option<String> {
        self.state.lock().expect("ingest job state poisoned").book_id.clone()
    }

    async fn run(&self, ctx: &JobContext) -> Result<String, JobDriverError> {
        if !self.source_path.is_file() {
            return Err(JobDriverError::InvalidSource(format!(
                "{} is not a file",
                self.source_path.display()
            )));
        }
        let file_name = self
            .source_path
            .file_name()
            .ok_or_else(|| JobDriverError::InvalidSource("source path has no file name".into()))?
            .to_owned();

        let originals_dir = ctx.home_dir.join("originals");
        tokio::fs::create_dir_all(&originals_dir)
            .await
            .map_err(|e| JobDriverError::Io(e.to_string()))?;

        let staging_dir = originals_dir.join(format!("staging-{}", Ulid::new()));
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| JobDriverError::Io(e.to_string()))?;
        let staged_path = staging_dir.join(&file_name);
        tokio::fs::copy(&self.source_path, &staged_path)
            .await
            .map_err(|e| JobDriverError::Io(e.to_string()))?;

        let page_count = self.page_counter.count_pages(&staged_path)?;
        let title = self.title.clone().unwrap_or_else(|| {
            Path::new(&file_name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name.to_string_lossy().into_owned())
        });

        let book = Book {
            id: String::new(),
            title,
            original_path: staged_path.display().to_string(),
            page_count,
            created_at: chrono::Utc::now(),
        };
        let book_id = ctx.store.create("Book", &serde_json::to_value(&book)?).await?;

        let final_dir = originals_dir.join(&book_id);
        tokio::fs::rename(&staging_dir, &final_dir)
            .await
            .map_err(|e| JobDriverError::Io(e.to_string()))?;
        let final_path = final_dir.join(&file_name);

        let patch = serde_json::json!({ "original_path": final_path.display().to_string() });
        ctx.sink
            .send_sync(StoreOp::update("Book", &book_id, patch, "ingest:relocate"))
            .await?;

        Ok(book_id)
    }
}

#[async_trait]
impl Job for IngestJob {
    fn set_record_id(&self, id: String) {
        self.state.lock().expect("ingest job state poisoned").record_id = Some(id);
    }

    fn record_id(&self) -> Option<String> {
        self.state.lock().expect("ingest job state poisoned").record_id.clone()
    }

    fn job_type(&self) -> String {
        "ingest".to_string()
    }

    async fn start(&self, ctx: &JobContext) -> Result<Vec<WorkUnit>, String> {
        let book_id = self.run(ctx).await.map_err(|e| e.to_string())?;
        self.state.lock().expect("ingest job state poisoned").book_id = Some(book_id);
        self.done.store(true, Ordering::SeqCst);
        Ok(vec![])
    }

    async fn on_complete(&self, _ctx: &JobContext, _result: WorkResult) -> Result<Vec<WorkUnit>, String> {
        Ok(vec![])
    }

    fn done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn pending_count(&self) -> usize {
        0
    }

    fn progress(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        if let Some(book_id) = self.book_id_result() {
            map.insert("book_id".to_string(), Value::String(book_id));
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookforge_scheduler_core::sink::Sink;
    use bookforge_scheduler_core::store::{DocumentStore, StoreOpResult};
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeStore {
        next_id: AtomicU64,
    }

    #[async_trait]
    impl DocumentStore for FakeStore {
        async fn execute(
            &self,
            _query_doc: &Value,
            _vars: &Value,
        ) -> Result<Value, bookforge_scheduler_core::error::StoreError> {
            Ok(Value::Null)
        }

        async fn create(
            &self,
            _collection: &str,
            _doc: &Value,
        ) -> Result<String, bookforge_scheduler_core::error::StoreError> {
            Ok(format!("book-{}", self.next_id.fetch_add(1, AtomicOrdering::Relaxed)))
        }

        async fn apply(&self, ops: &[StoreOp]) -> Vec<StoreOpResult> {
            ops.iter().map(|op| StoreOpResult { doc_id: op.doc_id.clone(), err: None }).collect()
        }
    }

    fn fake_pdf_bytes() -> Vec<u8> {
        b"%PDF-1.4\n1 0 obj<</Type/Page>>endobj\n2 0 obj<</Type/Page>>endobj\n%%EOF".to_vec()
    }

    #[tokio::test]
    async fn ingest_creates_book_and_finishes_synchronously() {
        let tmp = std::env::temp_dir().join(format!("bookforge-ingest-test-{}", Ulid::new()));
        let home_dir = tmp.join("home");
        tokio::fs::create_dir_all(&home_dir).await.unwrap();
        let source = tmp.join("source.pdf");
        tokio::fs::write(&source, fake_pdf_bytes()).await.unwrap();

        let store: Arc<dyn DocumentStore> = Arc::new(FakeStore::default());
        let sink = Arc::new(Sink::new(store.clone(), 10, Duration::from_secs(10)));
        sink.start().await;
        let ctx = JobContext { store, sink: sink.clone(), home_dir: home_dir.clone() };

        let job = IngestJob::with_default_counter(source, None);
        let units = job.start(&ctx).await.unwrap();
        assert!(units.is_empty());
        assert!(job.done());
        let book_id = job.book_id_result().unwrap();
        assert!(home_dir.join("originals").join(&book_id).join("source.pdf").exists());

        sink.stop().await;
        tokio::fs::remove_dir_all(&tmp).await.ok();
    }

    #[tokio::test]
    async fn ingest_rejects_missing_source() {
        let tmp = std::env::temp_dir().join(format!("bookforge-ingest-test-{}", Ulid::new()));
        tokio::fs::create_dir_all(&tmp).await.unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(FakeStore::default());
        let sink = Arc::new(Sink::new(store.clone(), 10, Duration::from_secs(10)));
        sink.start().await;
        let ctx = JobContext { store, sink: sink.clone(), home_dir: tmp.clone() };

        let job = IngestJob::with_default_counter(tmp.join("missing.pdf"), None);
        let result = job.start(&ctx).await;
        assert!(result.is_err());
        assert!(!job.done());

        sink.stop().await;
        tokio::fs::remove_dir_all(&tmp).await.ok();
    }
}
