//! Two-phase OCR driver: extract page images on the CPU pool, then run each
//! configured OCR provider over every extracted page.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use bookforge_scheduler_core::job::{Job, JobContext, PageState, PendingUnitInfo, WorkUnitTracker};
use bookforge_scheduler_core::store::StoreOp;
use bookforge_scheduler_core::types::{
    stage_priority, CpuRequest, MetricAttribution, OcrRequest, ResultPayload, WorkPayload, WorkResult, WorkUnit,
};
use bookforge_store_client::records::OcrResultRecord;

use crate::error::JobDriverError;

/// Reads a page's worth of pixels out of a source PDF. Stubbed behind a
/// trait so a real rendering library can be dropped in; the pool only ever
/// sees raw bytes via the registered `extract_page` handler.
pub trait PageExtractor: Send + Sync {
    /// Render the `page_index`-th (0-based) page of `pdf_path` to image bytes.
    fn extract_page(&self, pdf_path: &Path, page_index: u32) -> Result<Vec<u8>, String>;
}

/// Reference extractor: copies a fixed 1x1 PNG placeholder regardless of
/// input, so the driver and its tests exercise the CPU-dispatch path without
/// a real rendering dependency.
pub struct PlaceholderPageExtractor;

const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00, 0x90, 0x77, 0x53, 0xde, 0x00, 0x00, 0x00, 0x0c, 0x49,
    0x44, 0x41, 0x54, 0x08, 0xd7, 0x63, 0xf8, 0xcf, 0xc0, 0x00, 0x00, 0x03, 0x01, 0x01, 0x00, 0x18, 0xdd, 0x8d, 0xb0,
    0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

impl PageExtractor for PlaceholderPageExtractor {
    fn extract_page(&self, _pdf_path: &Path, _page_index: u32) -> Result<Vec<u8>, String> {
        Ok(PLACEHOLDER_PNG.to_vec())
    }
}

/// Adapts a [`PageExtractor`] into the CPU pool's synchronous handler shape.
///
/// Registered by the caller as the `extract_page` task: `scheduler.register_cpu_handler("extract_page", make_extract_page_handler(extractor)).await`.
pub fn make_extract_page_handler(
    extractor: Arc<dyn PageExtractor>,
) -> bookforge_scheduler_core::cpu_pool::CpuTaskHandler {
    Arc::new(move |data: Value| -> Result<Value, String> {
        let pdf_path = data.get("pdf_path").and_then(Value::as_str).ok_or("missing pdf_path")?;
        let page_index = data.get("page_num_within_pdf").and_then(Value::as_u64).ok_or("missing page_num_within_pdf")? as u32;
        let output_num = data.get("output_num").and_then(Value::as_u64).ok_or("missing output_num")?;
        let output_dir = data.get("output_dir").and_then(Value::as_str).ok_or("missing output_dir")?;

        let bytes = extractor.extract_page(Path::new(pdf_path), page_index)?;
        std::fs::create_dir_all(output_dir).map_err(|e| e.to_string())?;
        let output_path = Path::new(output_dir).join(format!("page-{output_num:04}.png"));
        std::fs::write(&output_path, &bytes).map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "path": output_path.display().to_string() }))
    })
}

/// Tunables for [`OcrJob`], mirroring `OcrJobConfig` from the design notes.
#[derive(Debug, Clone)]
pub struct OcrJobConfig {
    /// OCR provider pool names to run over every page.
    pub providers: Vec<String>,
    /// Job-level retry budget per page×provider (or per extract), on top of
    /// the pool's own transient-error retries.
    pub max_page_retries: u32,
}

impl Default for OcrJobConfig {
    fn default() -> Self {
        Self { providers: Vec::new(), max_page_retries: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedPage {
    #[serde(default)]
    id: String,
    book_id: String,
    page_num: u32,
    state: PageState,
    #[serde(default)]
    providers_done: Vec<String>,
}

#[derive(Debug, Clone)]
struct PageEntry {
    doc_id: Option<String>,
    state: PageState,
    providers_done: std::collections::HashSet<String>,
    retry_count: u32,
    image_path: Option<PathBuf>,
}

impl PageEntry {
    fn fresh() -> Self {
        Self { doc_id: None, state: PageState::ImageAbsent, providers_done: Default::default(), retry_count: 0, image_path: None }
    }
}

/// Extracts and OCRs every page of one book.
pub struct OcrJob {
    record_id: Mutex<Option<String>>,
    book_id: String,
    pdf_path: PathBuf,
    output_dir: PathBuf,
    page_count: u32,
    config: OcrJobConfig,
    pages: Mutex<Vec<PageEntry>>,
    tracker: Mutex<WorkUnitTracker>,
    loaded: AtomicBool,
}

impl OcrJob {
    /// Build a fresh OCR job for `page_count` pages of `pdf_path`, writing
    /// extracted images under `output_dir`.
    pub fn new(book_id: String, pdf_path: PathBuf, output_dir: PathBuf, page_count: u32, config: OcrJobConfig) -> Self {
        Self {
            record_id: Mutex::new(None),
            book_id,
            pdf_path,
            output_dir,
            page_count,
            config,
            pages: Mutex::new((0..page_count).map(|_| PageEntry::fresh()).collect()),
            tracker: Mutex::new(WorkUnitTracker::new()),
            loaded: AtomicBool::new(false),
        }
    }

    async fn load_persisted_pages(&self, ctx: &JobContext) -> Result<(), JobDriverError> {
        let query = serde_json::json!({
            "collection": "Page",
            "op": "query",
            "filter": { "book_id": self.book_id },
        });
        let existing = ctx.store.execute(&query, &Value::Null).await?;
        let Value::Array(docs) = existing else { return Ok(()) };
        let mut pages = self.pages.lock().expect("ocr job pages poisoned");
        for doc in docs {
            let Ok(parsed) = serde_json::from_value::<PersistedPage>(doc) else { continue };
            if parsed.page_num == 0 || parsed.page_num > self.page_count {
                continue;
            }
            let idx = (parsed.page_num - 1) as usize;
            pages[idx].doc_id = Some(parsed.id);
            pages[idx].state = parsed.state;
            pages[idx].providers_done = parsed.providers_done.into_iter().collect();
        }
        Ok(())
    }

    async fn ensure_page_doc(&self, ctx: &JobContext, page_num: u32) -> Result<String, JobDriverError> {
        let existing = {
            let pages = self.pages.lock().expect("ocr job pages poisoned");
            pages[(page_num - 1) as usize].doc_id.clone()
        };
        if let Some(id) = existing {
            return Ok(id);
        }
        let doc = serde_json::json!({
            "book_id": self.book_id,
            "page_num": page_num,
            "state": PageState::ImageAbsent,
            "providers_done": Vec::<String>::new(),
        });
        let id = ctx.store.create("Page", &doc).await?;
        self.pages.lock().expect("ocr job pages poisoned")[(page_num - 1) as usize].doc_id = Some(id.clone());
        Ok(id)
    }

    fn image_output_dir(&self) -> PathBuf {
        self.output_dir.clone()
    }

    fn extract_unit(&self, page_num: u32) -> WorkUnit {
        let data = serde_json::json!({
            "pdf_path": self.pdf_path.display().to_string(),
            "page_num_within_pdf": page_num - 1,
            "output_num": page_num,
            "output_dir": self.image_output_dir().display().to_string(),
        });
        WorkUnit::new(stage_priority("page_extract"), WorkPayload::Cpu(CpuRequest { task: "extract_page".into(), data }))
            .with_metrics(MetricAttribution {
                book_id: Some(self.book_id.clone()),
                stage: Some("page_extract".into()),
                item_key: Some(page_num.to_string()),
                ..Default::default()
            })
    }

    fn ocr_unit(&self, page_num: u32, provider: &str, image_bytes: Vec<u8>) -> WorkUnit {
        WorkUnit::new(
            stage_priority("page_ocr"),
            WorkPayload::Ocr(OcrRequest { image_bytes, page_num }),
        )
        .with_provider(provider)
        .with_metrics(MetricAttribution {
            book_id: Some(self.book_id.clone()),
            stage: Some("page_ocr".into()),
            item_key: Some(page_num.to_string()),
            ..Default::default()
        })
    }

    /// Outstanding OCR units for a page whose image is already on disk.
    async fn pending_ocr_units(&self, page_num: u32, image_path: &Path) -> Result<Vec<(WorkUnit, PendingUnitInfo)>, JobDriverError> {
        let pages = self.pages.lock().expect("ocr job pages poisoned");
        let entry = &pages[(page_num - 1) as usize];
        let outstanding: Vec<String> =
            self.config.providers.iter().filter(|p| !entry.providers_done.contains(*p)).cloned().collect();
        drop(pages);
        if outstanding.is_empty() {
            return Ok(Vec::new());
        }
        let bytes = tokio::fs::read(image_path).await.map_err(|e| JobDriverError::Io(e.to_string()))?;
        Ok(outstanding
            .into_iter()
            .map(|provider| {
                let unit = self.ocr_unit(page_num, &provider, bytes.clone());
                let info = PendingUnitInfo { sub_type: format!("ocr:{provider}"), page_num: Some(page_num), ..Default::default() };
                (unit, info)
            })
            .collect())
    }

    async fn persist_page_state(&self, ctx: &JobContext, page_num: u32) -> Result<(), JobDriverError> {
        let (doc_id, state, providers_done) = {
            let pages = self.pages.lock().expect("ocr job pages poisoned");
            let entry = &pages[(page_num - 1) as usize];
            (entry.doc_id.clone(), entry.state, entry.providers_done.iter().cloned().collect::<Vec<_>>())
        };
        let Some(doc_id) = doc_id else { return Ok(()) };
        let patch = serde_json::json!({ "state": state, "providers_done": providers_done });
        ctx.sink.send(StoreOp::update("Page", doc_id, patch, "ocr:page_state")).await?;
        Ok(())
    }

    async fn retry_or_give_up(
        &self,
        page_num: u32,
        rebuild: impl FnOnce() -> WorkUnit,
        sub_type: String,
    ) -> Option<(WorkUnit, PendingUnitInfo)> {
        let mut pages = self.pages.lock().expect("ocr job pages poisoned");
        let entry = &mut pages[(page_num - 1) as usize];
        if entry.retry_count >= self.config.max_page_retries {
            warn!(page_num, "ocr job-level retry budget exhausted, giving up on page");
            return None;
        }
        entry.retry_count += 1;
        let retry_count = entry.retry_count;
        drop(pages);
        let unit = rebuild();
        Some((unit, PendingUnitInfo { sub_type, page_num: Some(page_num), retry_count, ..Default::default() }))
    }
}

#[async_trait]
impl Job for OcrJob {
    fn set_record_id(&self, id: String) {
        *self.record_id.lock().expect("ocr job record_id poisoned") = Some(id);
    }

    fn record_id(&self) -> Option<String> {
        self.record_id.lock().expect("ocr job record_id poisoned").clone()
    }

    fn job_type(&self) -> String {
        "ocr".to_string()
    }

    fn book_id(&self) -> Option<String> {
        Some(self.book_id.clone())
    }

    async fn start(&self, ctx: &JobContext) -> Result<Vec<WorkUnit>, String> {
        if !self.loaded.swap(true, Ordering::SeqCst) {
            self.load_persisted_pages(ctx).await.map_err(|e| e.to_string())?;
        }

        let mut units: Vec<WorkUnit> = Vec::new();
        let mut pending_info: Vec<(usize, PendingUnitInfo)> = Vec::new();

        for page_num in 1..=self.page_count {
            self.ensure_page_doc(ctx, page_num).await.map_err(|e| e.to_string())?;
            let state = self.pages.lock().expect("ocr job pages poisoned")[(page_num - 1) as usize].state;
            match state {
                PageState::ImageAbsent => {
                    let unit = self.extract_unit(page_num);
                    pending_info.push((
                        units.len(),
                        PendingUnitInfo { sub_type: "extract_page".into(), page_num: Some(page_num), ..Default::default() },
                    ));
                    units.push(unit);
                }
                PageState::ImagePresent | PageState::OcrInProgress => {
                    let image_path = self.image_output_dir().join(format!("page-{page_num:04}.png"));
                    if !tokio::fs::try_exists(&image_path).await.unwrap_or(false) {
                        continue;
                    }
                    for (unit, info) in self.pending_ocr_units(page_num, &image_path).await.map_err(|e| e.to_string())? {
                        pending_info.push((units.len(), info));
                        units.push(unit);
                    }
                }
                PageState::OcrComplete => {}
            }
        }

        let mut tracker = self.tracker.lock().expect("ocr job tracker poisoned");
        for (idx, info) in pending_info {
            tracker.track(&units[idx], info);
        }
        drop(tracker);

        Ok(units)
    }

    async fn on_complete(&self, ctx: &JobContext, result: WorkResult) -> Result<Vec<WorkUnit>, String> {
        let info = {
            let mut tracker = self.tracker.lock().expect("ocr job tracker poisoned");
            tracker.complete(&result.work_unit_id)
        };
        let Some(info) = info else { return Ok(Vec::new()) };
        let Some(page_num) = info.page_num else { return Ok(Vec::new()) };

        if info.sub_type == "extract_page" {
            if !result.success {
                let rebuilt = self.retry_or_give_up(page_num, || self.extract_unit(page_num), "extract_page".into()).await;
                return match rebuilt {
                    Some((unit, retry_info)) => {
                        self.tracker.lock().expect("ocr job tracker poisoned").track(&unit, retry_info);
                        Ok(vec![unit])
                    }
                    None => Ok(Vec::new()),
                };
            }
            let Some(ResultPayload::Cpu(data)) = result.payload else {
                return Err("extract_page result carried no payload".into());
            };
            let path = data.get("path").and_then(Value::as_str).ok_or("extract_page result missing path")?;
            let image_path = PathBuf::from(path);

            {
                let mut pages = self.pages.lock().expect("ocr job pages poisoned");
                pages[(page_num - 1) as usize].state = PageState::ImagePresent;
                pages[(page_num - 1) as usize].image_path = Some(image_path.clone());
            }
            self.persist_page_state(ctx, page_num).await.map_err(|e| e.to_string())?;

            let mut units = Vec::new();
            let pending = self.pending_ocr_units(page_num, &image_path).await.map_err(|e| e.to_string())?;
            if !pending.is_empty() {
                self.pages.lock().expect("ocr job pages poisoned")[(page_num - 1) as usize].state = PageState::OcrInProgress;
                self.persist_page_state(ctx, page_num).await.map_err(|e| e.to_string())?;
            }
            let mut tracker = self.tracker.lock().expect("ocr job tracker poisoned");
            for (unit, unit_info) in pending {
                tracker.track(&unit, unit_info);
                units.push(unit);
            }
            return Ok(units);
        }

        // `ocr:<provider>`
        let provider = info.sub_type.strip_prefix("ocr:").unwrap_or(&info.sub_type).to_string();
        if !result.success {
            let image_path = self.pages.lock().expect("ocr job pages poisoned")[(page_num - 1) as usize]
                .image_path
                .clone();
            let Some(image_path) = image_path else { return Ok(Vec::new()) };
            let bytes = tokio::fs::read(&image_path).await.map_err(|e| e.to_string())?;
            let provider_for_retry = provider.clone();
            let sub_type = info.sub_type.clone();
            let rebuilt = self
                .retry_or_give_up(page_num, || self.ocr_unit(page_num, &provider_for_retry, bytes), sub_type)
                .await;
            return match rebuilt {
                Some((unit, retry_info)) => {
                    self.tracker.lock().expect("ocr job tracker poisoned").track(&unit, retry_info);
                    Ok(vec![unit])
                }
                None => Ok(Vec::new()),
            };
        }

        let Some(ResultPayload::Ocr(ocr_result)) = result.payload else {
            return Err("ocr result carried no payload".into());
        };

        let record = OcrResultRecord {
            id: String::new(),
            book_id: self.book_id.clone(),
            page_num,
            provider: provider.clone(),
            text: ocr_result.text,
            cost_usd: ocr_result.cost_usd,
        };
        ctx.sink
            .send(StoreOp::create("OcrResult", serde_json::to_value(&record).map_err(|e| e.to_string())?, "ocr:result"))
            .await
            .map_err(|e| e.to_string())?;

        {
            let mut pages = self.pages.lock().expect("ocr job pages poisoned");
            let entry = &mut pages[(page_num - 1) as usize];
            entry.providers_done.insert(provider);
            if self.config.providers.iter().all(|p| entry.providers_done.contains(p)) {
                entry.state = PageState::OcrComplete;
            }
        }
        self.persist_page_state(ctx, page_num).await.map_err(|e| e.to_string())?;
        Ok(Vec::new())
    }

    fn done(&self) -> bool {
        self.pages.lock().expect("ocr job pages poisoned").iter().all(|p| p.state == PageState::OcrComplete)
    }

    fn pending_count(&self) -> usize {
        self.tracker.lock().expect("ocr job tracker poisoned").len()
    }

    fn progress(&self) -> HashMap<String, Value> {
        let pages = self.pages.lock().expect("ocr job pages poisoned");
        let complete = pages.iter().filter(|p| p.state == PageState::OcrComplete).count();
        let mut map = HashMap::new();
        map.insert("pages_total".to_string(), Value::from(self.page_count));
        map.insert("pages_complete".to_string(), Value::from(complete as u64));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookforge_scheduler_core::sink::Sink;
    use bookforge_scheduler_core::store::{DocumentStore, StoreOpResult};
    use bookforge_scheduler_core::types::WorkKind;
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
            Ok(Value::Array(Vec::new()))
        }

        async fn create(
            &self,
            _collection: &str,
            _doc: &Value,
        ) -> Result<String, bookforge_scheduler_core::error::StoreError> {
            Ok(format!("page-{}", self.next_id.fetch_add(1, AtomicOrdering::Relaxed)))
        }

        async fn apply(&self, ops: &[StoreOp]) -> Vec<StoreOpResult> {
            ops.iter().map(|op| StoreOpResult { doc_id: op.doc_id.clone(), err: None }).collect()
        }
    }

    fn test_ctx(home_dir: PathBuf) -> (JobContext, Arc<Sink>) {
        let store: Arc<dyn DocumentStore> = Arc::new(FakeStore::default());
        let sink = Arc::new(Sink::new(store.clone(), 10, Duration::from_secs(10)));
        (JobContext { store, sink: sink.clone(), home_dir }, sink)
    }

    #[tokio::test]
    async fn start_emits_extract_units_for_absent_pages() {
        let tmp = std::env::temp_dir().join(format!("bookforge-ocr-test-{}", ulid::Ulid::new()));
        let (ctx, sink) = test_ctx(tmp.clone());
        sink.start().await;

        let job = OcrJob::new(
            "book-1".into(),
            tmp.join("source.pdf"),
            tmp.join("pages"),
            2,
            OcrJobConfig { providers: vec!["openai".into()], max_page_retries: 10 },
        );
        let units = job.start(&ctx).await.unwrap();
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|u| u.kind() == WorkKind::Cpu));

        sink.stop().await;
        tokio::fs::remove_dir_all(&tmp).await.ok();
    }

    #[tokio::test]
    async fn extract_completion_emits_ocr_units_and_ocr_completion_marks_page_done() {
        let tmp = std::env::temp_dir().join(format!("bookforge-ocr-test-{}", ulid::Ulid::new()));
        let (ctx, sink) = test_ctx(tmp.clone());
        sink.start().await;

        let job = OcrJob::new(
            "book-1".into(),
            tmp.join("source.pdf"),
            tmp.join("pages"),
            1,
            OcrJobConfig { providers: vec!["openai".into()], max_page_retries: 10 },
        );
        let start_units = job.start(&ctx).await.unwrap();
        assert_eq!(start_units.len(), 1);
        let extract_unit = &start_units[0];

        tokio::fs::create_dir_all(tmp.join("pages")).await.unwrap();
        let image_path = tmp.join("pages").join("page-0001.png");
        tokio::fs::write(&image_path, b"fake-png").await.unwrap();

        let extract_result = WorkResult::success(
            extract_unit,
            ResultPayload::Cpu(serde_json::json!({ "path": image_path.display().to_string() })),
        );
        let ocr_units = job.on_complete(&ctx, extract_result).await.unwrap();
        assert_eq!(ocr_units.len(), 1);
        assert_eq!(ocr_units[0].provider, "openai");
        assert!(!job.done());

        let ocr_result = WorkResult::success(
            &ocr_units[0],
            ResultPayload::Ocr(bookforge_scheduler_core::types::OcrResult {
                text: "hello".into(),
                cost_usd: 0.01,
                execution_time: Duration::from_millis(5),
            }),
        );
        let follow_up = job.on_complete(&ctx, ocr_result).await.unwrap();
        assert!(follow_up.is_empty());
        assert!(job.done());

        sink.stop().await;
        tokio::fs::remove_dir_all(&tmp).await.ok();
    }

    #[tokio::test]
    async fn failed_ocr_unit_retries_until_budget_exhausted() {
        let tmp = std::env::temp_dir().join(format!("bookforge-ocr-test-{}", ulid::Ulid::new()));
        let (ctx, sink) = test_ctx(tmp.clone());
        sink.start().await;

        let job = OcrJob::new(
            "book-1".into(),
            tmp.join("source.pdf"),
            tmp.join("pages"),
            1,
            OcrJobConfig { providers: vec!["openai".into()], max_page_retries: 1 },
        );
        let start_units = job.start(&ctx).await.unwrap();
        tokio::fs::create_dir_all(tmp.join("pages")).await.unwrap();
        let image_path = tmp.join("pages").join("page-0001.png");
        tokio::fs::write(&image_path, b"fake-png").await.unwrap();
        let extract_result = WorkResult::success(
            &start_units[0],
            ResultPayload::Cpu(serde_json::json!({ "path": image_path.display().to_string() })),
        );
        let ocr_units = job.on_complete(&ctx, extract_result).await.unwrap();

        let failure = WorkResult::failure(&ocr_units[0], "provider exhausted");
        let retried = job.on_complete(&ctx, failure).await.unwrap();
        assert_eq!(retried.len(), 1, "first failure should re-enqueue once under the retry budget");

        let failure_again = WorkResult::failure(&retried[0], "provider exhausted");
        let gave_up = job.on_complete(&ctx, failure_again).await.unwrap();
        assert!(gave_up.is_empty(), "budget of 1 retry exhausted, job should give up");
        assert!(!job.done());

        sink.stop().await;
        tokio::fs::remove_dir_all(&tmp).await.ok();
    }
}
