//! Provider worker pool: one dispatcher + N workers against a rate-limited adapter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::adapters::{is_retriable, AdapterError, LlmAdapter, OcrAdapter, TtsAdapter};
use crate::error::PoolError;
use crate::priority_queue::{PriorityQueue, QueueStats};
use crate::rate_limiter::{RateLimiter, RateLimiterStatus};
use crate::sink::Sink;
use crate::store::StoreOp;
use crate::types::{ResultPayload, WorkKind, WorkPayload, WorkResult, WorkUnit};

const DEFAULT_MAX_RETRIES: u32 = 7;
const BASE_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Concrete adapter a provider pool dispatches to, unified across kinds so
/// the dispatcher/worker loop is written once.
#[derive(Clone)]
pub enum ProviderHandle {
    /// Language-model adapter.
    Llm(Arc<dyn LlmAdapter>),
    /// OCR adapter.
    Ocr(Arc<dyn OcrAdapter>),
    /// TTS adapter.
    Tts(Arc<dyn TtsAdapter>),
}

impl ProviderHandle {
    /// The [`WorkKind`] this adapter serves.
    pub fn kind(&self) -> WorkKind {
        match self {
            ProviderHandle::Llm(_) => WorkKind::Llm,
            ProviderHandle::Ocr(_) => WorkKind::Ocr,
            ProviderHandle::Tts(_) => WorkKind::Tts,
        }
    }

    /// Provider display name.
    pub fn name(&self) -> &str {
        match self {
            ProviderHandle::Llm(a) => a.name(),
            ProviderHandle::Ocr(a) => a.name(),
            ProviderHandle::Tts(a) => a.name(),
        }
    }

    /// Configured steady-state requests-per-second.
    pub fn requests_per_second(&self) -> f64 {
        match self {
            ProviderHandle::Llm(a) => a.requests_per_second(),
            ProviderHandle::Ocr(a) => a.requests_per_second(),
            ProviderHandle::Tts(a) => a.requests_per_second(),
        }
    }

    /// Configured worker concurrency.
    pub fn max_concurrency(&self) -> usize {
        match self {
            ProviderHandle::Llm(a) => a.max_concurrency(),
            ProviderHandle::Ocr(a) => a.max_concurrency(),
            ProviderHandle::Tts(a) => a.max_concurrency(),
        }
    }

    /// Configured retry ceiling.
    pub fn max_retries(&self) -> u32 {
        match self {
            ProviderHandle::Llm(a) => a.max_retries(),
            ProviderHandle::Ocr(a) => a.max_retries(),
            ProviderHandle::Tts(a) => a.max_retries(),
        }
    }

    async fn execute(&self, unit: &WorkUnit) -> Result<ResultPayload, AdapterError> {
        match (self, &unit.payload) {
            (ProviderHandle::Llm(adapter), WorkPayload::Llm(req)) => {
                let api_req = crate::adapters::ChatApiRequest {
                    messages: req.messages.clone(),
                    model: req.model.clone(),
                };
                let result = match &unit.tools {
                    Some(tools) if !tools.is_empty() => adapter.chat_with_tools(api_req, tools).await,
                    _ => adapter.chat(api_req).await,
                };
                result.map(ResultPayload::Llm)
            }
            (ProviderHandle::Ocr(adapter), WorkPayload::Ocr(req)) => adapter
                .process_image(&req.image_bytes, req.page_num)
                .await
                .map(ResultPayload::Ocr),
            (ProviderHandle::Tts(adapter), WorkPayload::Tts(req)) => {
                adapter.generate(req).await.map(ResultPayload::Tts)
            }
            _ => Err(AdapterError::Other("unit payload kind does not match pool kind".into())),
        }
    }
}

/// Live status of a [`ProviderPool`], for the scheduler's monitoring surface.
#[derive(Debug, Clone)]
pub struct ProviderPoolStatus {
    /// Pool name.
    pub name: String,
    /// Kind this pool serves.
    pub kind: WorkKind,
    /// Configured worker count.
    pub workers: usize,
    /// Units currently executing.
    pub in_flight: usize,
    /// Priority-queue depth snapshot.
    pub queue: QueueStats,
    /// Rate-limiter status snapshot.
    pub rate_limiter: RateLimiterStatus,
}

/// One dispatcher task (owning the rate limiter and priority queue) plus N
/// stateless worker tasks executing against a single provider adapter.
pub struct ProviderPool {
    name: String,
    adapter_kind: WorkKind,
    queue: Arc<PriorityQueue>,
    limiter: Arc<RateLimiter>,
    in_flight: Arc<AtomicUsize>,
    worker_count: usize,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl ProviderPool {
    /// Start a pool against `adapter`, with `worker_count` workers (0 = adapter's
    /// `max_concurrency`) and the given bucket `capacity`/`rps`. `results`
    /// receives one [`WorkResult`] per finished unit; `sink`, if given, receives
    /// metric records per §4.3. `token` stops the pool on cancellation.
    pub fn start(
        name: impl Into<String>,
        adapter: ProviderHandle,
        worker_count: usize,
        capacity: f64,
        rps: f64,
        results: mpsc::Sender<WorkResult>,
        sink: Option<Arc<Sink>>,
        token: CancellationToken,
    ) -> Self {
        let name = name.into();
        let adapter_kind = adapter.kind();
        let worker_count = if worker_count == 0 { adapter.max_concurrency().max(1) } else { worker_count };
        let queue = Arc::new(PriorityQueue::new());
        let limiter = Arc::new(RateLimiter::new(capacity, rps));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let (work_tx, work_rx) = mpsc::channel(worker_count);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        let max_retries = adapter.max_retries();
        let adapter = Arc::new(adapter);

        let dispatcher = tokio::spawn(run_dispatcher(
            name.clone(),
            queue.clone(),
            limiter.clone(),
            work_tx,
            token.clone(),
        ));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            workers.push(tokio::spawn(run_worker(
                name.clone(),
                worker_id,
                adapter.clone(),
                work_rx.clone(),
                limiter.clone(),
                in_flight.clone(),
                max_retries,
                results.clone(),
                sink.clone(),
                token.clone(),
            )));
        }

        Self { name, adapter_kind, queue, limiter, in_flight, worker_count, dispatcher, workers }
    }

    /// The kind of unit this pool accepts.
    pub fn kind(&self) -> WorkKind {
        self.adapter_kind
    }

    /// Enqueue a unit for this pool. Errors if the unit's kind doesn't match.
    pub fn submit(&self, unit: WorkUnit) -> Result<(), PoolError> {
        if unit.kind() != self.adapter_kind {
            return Err(PoolError::KindMismatch { expected: self.adapter_kind, actual: unit.kind() });
        }
        self.queue.push(unit).map_err(|_| PoolError::Stopped { pool: self.name.clone() })
    }

    /// Current status snapshot.
    pub fn status(&self) -> ProviderPoolStatus {
        ProviderPoolStatus {
            name: self.name.clone(),
            kind: self.adapter_kind,
            workers: self.worker_count,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            queue: self.queue.stats(),
            rate_limiter: self.limiter.status(),
        }
    }

    /// Await the dispatcher and all workers, e.g. during graceful shutdown.
    pub async fn join(self) {
        let _ = self.dispatcher.await;
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[instrument(skip(queue, limiter, work_tx, token), fields(pool = %name))]
async fn run_dispatcher(
    name: String,
    queue: Arc<PriorityQueue>,
    limiter: Arc<RateLimiter>,
    work_tx: mpsc::Sender<WorkUnit>,
    token: CancellationToken,
) {
    loop {
        let Some(unit) = queue.pop(&token).await else {
            debug!("dispatcher shutting down");
            return;
        };
        if limiter.acquire(&token).await.is_err() {
            return;
        }
        if work_tx.send(unit).await.is_err() {
            return;
        }
    }
}

#[instrument(skip(adapter, work_rx, limiter, in_flight, results, sink, token), fields(pool = %pool_name, worker = worker_id))]
#[allow(clippy::too_many_arguments)]
async fn run_worker(
    pool_name: String,
    worker_id: usize,
    adapter: Arc<ProviderHandle>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkUnit>>>,
    limiter: Arc<RateLimiter>,
    in_flight: Arc<AtomicUsize>,
    max_retries: u32,
    results: mpsc::Sender<WorkResult>,
    sink: Option<Arc<Sink>>,
    token: CancellationToken,
) {
    loop {
        let unit = {
            let mut guard = work_rx.lock().await;
            tokio::select! {
                unit = guard.recv() => unit,
                _ = token.cancelled() => None,
            }
        };
        let Some(unit) = unit else {
            return;
        };
        in_flight.fetch_add(1, Ordering::Relaxed);
        let mut result = execute_with_retry(&adapter, &unit, max_retries, &limiter, &token).await;
        in_flight.fetch_sub(1, Ordering::Relaxed);

        if let Some(sink) = &sink {
            emit_metric(sink, &unit, &mut result).await;
        }

        if results.send(result).await.is_err() {
            return;
        }
    }
}

async fn execute_with_retry(
    adapter: &ProviderHandle,
    unit: &WorkUnit,
    max_retries: u32,
    limiter: &RateLimiter,
    token: &CancellationToken,
) -> WorkResult {
    let mut attempt = 0u32;
    let mut last_err: Option<AdapterError> = None;
    loop {
        if token.is_cancelled() {
            return WorkResult::failure(unit, "cancelled");
        }
        match adapter.execute(unit).await {
            Ok(ResultPayload::Llm(chat_result)) if chat_result.result_error.is_some() => {
                let message = chat_result.result_error.clone().unwrap_or_default();
                let retriable = crate::adapters::is_result_error_retriable(&message);
                if !retriable || attempt >= max_retries {
                    let total_attempts = attempt + 1;
                    let final_message = if attempt >= max_retries {
                        format!("failed after {total_attempts} attempts: {message}")
                    } else {
                        message.clone()
                    };
                    return WorkResult::failure(unit, final_message);
                }
                warn!(unit_id = %unit.id, attempt, error = %message, "retrying llm result-level error");
                let backoff = backoff_for_attempt(attempt);
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = token.cancelled() => {
                        return WorkResult::failure(unit, format!("cancelled during retry: {message}"));
                    }
                }
                attempt += 1;
            }
            Ok(payload) => return WorkResult::success(unit, payload),
            Err(err) => {
                let retriable = is_retriable(&err);
                if let AdapterError::RateLimited(rl) = &err {
                    limiter.record_429(rl.retry_after);
                }
                if !retriable || attempt >= max_retries {
                    let total_attempts = attempt + 1;
                    let message = if attempt >= max_retries {
                        format!("failed after {total_attempts} attempts: {err}")
                    } else {
                        err.to_string()
                    };
                    return WorkResult::failure(unit, message);
                }
                warn!(unit_id = %unit.id, attempt, error = %err, "retrying work unit");
                let backoff = match &err {
                    AdapterError::RateLimited(rl) => rl.retry_after,
                    _ => backoff_for_attempt(attempt),
                };
                last_err = Some(err);
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = token.cancelled() => {
                        let msg = last_err.map(|e| e.to_string()).unwrap_or_default();
                        return WorkResult::failure(unit, format!("cancelled during retry: {msg}"));
                    }
                }
                attempt += 1;
            }
        }
    }
}

fn backoff_for_attempt(attempt: u32) -> Duration {
    let base = BASE_BACKOFF.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let jitter_ms: u64 = rand::thread_rng().gen_range(0..1000);
    Duration::from_millis(base.saturating_add(jitter_ms)).min(MAX_BACKOFF)
}

async fn emit_metric(sink: &Arc<Sink>, unit: &WorkUnit, result: &mut WorkResult) {
    let Some(attribution) = unit.metrics.as_ref() else {
        return;
    };
    let doc = json!({
        "book_id": attribution.book_id,
        "page_id": attribution.page_id,
        "stage": attribution.stage,
        "item_key": attribution.item_key,
        "prompt_key": attribution.prompt_key,
        "success": result.success,
        "error": result.error,
        "kind": format!("{:?}", unit.kind()),
    });
    let op = StoreOp::create("Metric", doc, "provider_pool");
    match unit.kind() {
        WorkKind::Llm => {
            let applied = sink.send_sync(op).await;
            if let Ok(res) = applied {
                result.metric_id = res.doc_id;
            }
        }
        _ => {
            let _ = sink.send(op).await;
        }
    }
}
