//! Scheduler: pool registry, job registry, result demultiplexer, routing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::cpu_pool::{CpuPool, CpuPoolStatus, CpuTaskHandler};
use crate::error::SchedulerError;
use crate::job::{Job, JobContext, JobRecord, JobStatus};
use crate::job_manager::JobManager;
use crate::provider_pool::{ProviderHandle, ProviderPool, ProviderPoolStatus};
use crate::sink::Sink;
use crate::store::DocumentStore;
use crate::types::{WorkKind, WorkResult, WorkUnit};

/// Snapshot of every pool's status, for monitoring.
#[derive(Debug, Clone, Default)]
pub struct PoolStatuses {
    /// Provider pool statuses, keyed by pool name.
    pub providers: Vec<ProviderPoolStatus>,
    /// CPU pool status, if initialized.
    pub cpu: Option<CpuPoolStatus>,
}

/// A registered provider to stand up as a pool in [`Scheduler::init_from_registry`].
pub struct RegisteredProvider {
    /// Pool name (defaults to the adapter's own name if `None`).
    pub name: Option<String>,
    /// The adapter to dispatch against.
    pub adapter: ProviderHandle,
    /// Pool sizing/rate configuration.
    pub config: crate::config::PoolConfig,
}

/// Constructor for a job of a given type, given its (optional) book id.
/// Used both for fresh submission ([`Scheduler::submit_by_type`]) and resume.
pub type JobFactory = Arc<dyn Fn(Option<String>) -> Arc<dyn Job> + Send + Sync>;

struct JobEntry {
    job: Arc<dyn Job>,
    pending: AtomicUsize,
}

/// Owns pools, jobs, and the result-demultiplexer loop described in §4.5.
pub struct Scheduler {
    pools: Mutex<HashMap<String, Arc<ProviderPool>>>,
    cpu_pool: Mutex<Option<Arc<CpuPool>>>,
    jobs: Mutex<HashMap<String, Arc<JobEntry>>>,
    factories: Mutex<HashMap<String, JobFactory>>,
    results_tx: mpsc::Sender<WorkResult>,
    results_rx: Mutex<Option<mpsc::Receiver<WorkResult>>>,
    manager: Option<Arc<dyn JobManager>>,
    sink: Arc<Sink>,
    store: Arc<dyn DocumentStore>,
    home_dir: PathBuf,
    token: CancellationToken,
}

impl Scheduler {
    /// Build a scheduler over `store`/`sink`, with a results channel buffered
    /// to `results_capacity`. `manager` is optional: without one, job records
    /// are synthesised with a local id and never persisted.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        sink: Arc<Sink>,
        manager: Option<Arc<dyn JobManager>>,
        home_dir: PathBuf,
        results_capacity: usize,
    ) -> Arc<Self> {
        let (results_tx, results_rx) = mpsc::channel(results_capacity.max(1));
        Arc::new(Self {
            pools: Mutex::new(HashMap::new()),
            cpu_pool: Mutex::new(None),
            jobs: Mutex::new(HashMap::new()),
            factories: Mutex::new(HashMap::new()),
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
            manager,
            sink,
            store,
            home_dir,
            token: CancellationToken::new(),
        })
    }

    /// The scheduler's root cancellation token; cancel it to stop `run()`,
    /// every pool, and the sink flusher.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn context(&self) -> JobContext {
        JobContext { store: self.store.clone(), sink: self.sink.clone(), home_dir: self.home_dir.clone() }
    }

    /// Register a provider pool, wiring its results into the scheduler's
    /// shared channel and sink.
    pub async fn register_pool(self: &Arc<Self>, name: impl Into<String>, adapter: ProviderHandle, config: crate::config::PoolConfig) {
        let name = name.into();
        let pool = Arc::new(ProviderPool::start(
            name.clone(),
            adapter,
            config.workers,
            config.capacity,
            config.rps,
            self.results_tx.clone(),
            Some(self.sink.clone()),
            self.token.clone(),
        ));
        self.pools.lock().await.insert(name, pool);
    }

    /// Stand up one pool per entry in `registry`, per §4.5.
    pub async fn init_from_registry(self: &Arc<Self>, registry: Vec<RegisteredProvider>) {
        for entry in registry {
            let name = entry.name.clone().unwrap_or_else(|| entry.adapter.name().to_string());
            self.register_pool(name, entry.adapter, entry.config).await;
        }
    }

    /// Create the cpu pool with `worker_count` workers (0 = host cpu count),
    /// registered under the name `"cpu"`.
    pub async fn init_cpu_pool(self: &Arc<Self>, worker_count: usize) {
        let pool = Arc::new(CpuPool::start("cpu", worker_count, self.results_tx.clone(), self.token.clone()));
        *self.cpu_pool.lock().await = Some(pool);
    }

    /// Register a handler for `task` on the cpu pool. Panics if the cpu pool
    /// has not been initialized via [`Scheduler::init_cpu_pool`].
    pub async fn register_cpu_handler(&self, task: impl Into<String>, handler: CpuTaskHandler) {
        let pool = self.cpu_pool.lock().await.clone().expect("cpu pool not initialized");
        pool.register_handler(task, handler).await;
    }

    /// Register a job-type factory, used by [`Scheduler::submit_by_type`] and [`Scheduler::resume`].
    pub async fn register_factory(&self, job_type: impl Into<String>, factory: JobFactory) {
        self.factories.lock().await.insert(job_type.into(), factory);
    }

    /// Persist a job record, call `start`, and route its initial work units.
    ///
    /// Runs on a detached task so a caller who drops the awaiting future
    /// (e.g. on their own timeout) does not abort the job mid-submit; only
    /// the synchronous record-creation-plus-initial-enqueue portion is ever
    /// in flight under the caller's own cancellation scope.
    #[instrument(skip(self, job))]
    pub async fn submit(self: &Arc<Self>, job: Arc<dyn Job>) -> Result<String, SchedulerError> {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.do_submit(job).await });
        handle.await.map_err(|_| SchedulerError::StartFailed("submit task was aborted".into()))?
    }

    async fn do_submit(self: Arc<Self>, job: Arc<dyn Job>) -> Result<String, SchedulerError> {
        let record = JobRecord::new(job.job_type(), job.book_id());
        let id = match &self.manager {
            Some(manager) => manager.create(record).await?.id,
            None => ulid::Ulid::new().to_string(),
        };
        job.set_record_id(id.clone());
        if let Some(manager) = &self.manager {
            manager.set_status(&id, JobStatus::Running, None).await?;
        }

        let ctx = self.context();
        let units = match job.start(&ctx).await {
            Ok(units) => units,
            Err(e) => {
                if let Some(manager) = &self.manager {
                    let _ = manager.set_status(&id, JobStatus::Failed, Some(e.clone())).await;
                }
                return Err(SchedulerError::StartFailed(e));
            }
        };

        let entry = Arc::new(JobEntry { job: job.clone(), pending: AtomicUsize::new(0) });
        self.jobs.lock().await.insert(id.clone(), entry.clone());

        if units.is_empty() && job.done() {
            if let Some(manager) = &self.manager {
                let _ = manager.set_status(&id, JobStatus::Completed, None).await;
            }
            self.jobs.lock().await.remove(&id);
            info!(job_id = %id, "job completed synchronously");
            return Ok(id);
        }

        self.route_units(&id, &entry, units).await;
        Ok(id)
    }

    /// Build and submit a job via a registered factory, for pipeline chaining.
    pub async fn submit_by_type(self: &Arc<Self>, job_type: &str, book_id: Option<String>) -> Result<String, SchedulerError> {
        let factory = self
            .factories
            .lock()
            .await
            .get(job_type)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJobType(job_type.to_string()))?;
        let job = factory(book_id);
        self.submit(job).await
    }

    async fn route_units(&self, job_id: &str, entry: &Arc<JobEntry>, units: Vec<WorkUnit>) {
        for mut unit in units {
            unit.job_id = job_id.to_string();
            entry.pending.fetch_add(1, Ordering::Relaxed);
            if let Err(result) = self.dispatch_unit(unit).await {
                if self.results_tx.send(result).await.is_err() {
                    warn!(job_id = %job_id, "results channel closed while synthesising failure");
                }
            }
        }
    }

    async fn dispatch_unit(&self, unit: WorkUnit) -> Result<(), WorkResult> {
        if unit.kind() == WorkKind::Cpu {
            let pool = self.cpu_pool.lock().await.clone();
            return match pool {
                Some(pool) => pool.submit(unit.clone()).map_err(|e| WorkResult::failure(&unit, e.to_string())),
                None => Err(WorkResult::failure(&unit, SchedulerError::NoPoolForKind(WorkKind::Cpu).to_string())),
            };
        }

        let pools = self.pools.lock().await;
        let pool = if !unit.provider.is_empty() {
            match pools.get(&unit.provider) {
                Some(pool) if pool.kind() == unit.kind() => Some(pool.clone()),
                Some(pool) => {
                    let err = SchedulerError::ProviderKindMismatch {
                        pool: unit.provider.clone(),
                        pool_kind: pool.kind(),
                        unit_kind: unit.kind(),
                    };
                    return Err(WorkResult::failure(&unit, err.to_string()));
                }
                None => return Err(WorkResult::failure(&unit, SchedulerError::UnknownPool(unit.provider.clone()).to_string())),
            }
        } else {
            pools.values().find(|p| p.kind() == unit.kind()).cloned()
        };
        drop(pools);

        match pool {
            Some(pool) => pool.submit(unit.clone()).map_err(|e| WorkResult::failure(&unit, e.to_string())),
            None => Err(WorkResult::failure(&unit, SchedulerError::NoPoolForKind(unit.kind()).to_string())),
        }
    }

    /// Run the result-demultiplexer loop until the scheduler's token is cancelled.
    pub async fn run(self: &Arc<Self>) {
        let mut rx = match self.results_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                error!("Scheduler::run called more than once");
                return;
            }
        };
        loop {
            tokio::select! {
                maybe_result = rx.recv() => {
                    match maybe_result {
                        Some(result) => self.handle_result(result).await,
                        None => return,
                    }
                }
                _ = self.token.cancelled() => {
                    self.sink.stop().await;
                    return;
                }
            }
        }
    }

    async fn handle_result(self: &Arc<Self>, result: WorkResult) {
        let entry = self.jobs.lock().await.get(&result.job_id).cloned();
        let Some(entry) = entry else {
            warn!(job_id = %result.job_id, "result for unknown or already-finished job");
            return;
        };
        entry.pending.fetch_sub(1, Ordering::Relaxed);

        let ctx = self.context();
        match entry.job.on_complete(&ctx, result).await {
            Ok(new_units) => {
                self.route_units(&entry.job.record_id().unwrap_or_default(), &entry, new_units).await;
            }
            Err(e) => {
                error!(error = %e, "job on_complete failed, marking terminal");
                if let Some(id) = entry.job.record_id() {
                    if let Some(manager) = &self.manager {
                        let _ = manager.set_status(&id, JobStatus::Failed, Some(e)).await;
                    }
                    self.jobs.lock().await.remove(&id);
                }
                return;
            }
        }

        if entry.job.done() && entry.pending.load(Ordering::Relaxed) == 0 {
            if let Some(id) = entry.job.record_id() {
                if let Some(manager) = &self.manager {
                    let _ = manager.set_status(&id, JobStatus::Completed, None).await;
                }
                self.jobs.lock().await.remove(&id);
                info!(job_id = %id, "job completed");
            }
        }
    }

    /// Rebuild every persisted `Running` job via its factory and resume it.
    pub async fn resume(self: &Arc<Self>) -> Result<usize, SchedulerError> {
        let Some(manager) = &self.manager else {
            return Ok(0);
        };
        let records = manager.list_running().await.map_err(SchedulerError::Manager)?;
        let factories = self.factories.lock().await.clone();
        let mut resumed = 0;
        for record in records {
            let Some(factory) = factories.get(&record.job_type) else {
                warn!(job_type = %record.job_type, "no factory registered to resume job type");
                continue;
            };
            let job = factory(record.book_id.clone());
            job.set_record_id(record.id.clone());
            let entry = Arc::new(JobEntry { job: job.clone(), pending: AtomicUsize::new(0) });
            self.jobs.lock().await.insert(record.id.clone(), entry.clone());

            let ctx = self.context();
            match job.start(&ctx).await {
                Ok(units) if units.is_empty() && job.done() => {
                    let _ = manager.set_status(&record.id, JobStatus::Completed, None).await;
                    self.jobs.lock().await.remove(&record.id);
                }
                Ok(units) => {
                    self.route_units(&record.id, &entry, units).await;
                }
                Err(e) => {
                    let _ = manager.set_status(&record.id, JobStatus::Failed, Some(e)).await;
                    self.jobs.lock().await.remove(&record.id);
                }
            }
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Status map for a job, augmented with `pending_units`.
    pub async fn job_status(&self, id: &str) -> Result<Value, SchedulerError> {
        let entry = self.jobs.lock().await.get(id).cloned().ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        Ok(json!({
            "pending_units": entry.pending.load(Ordering::Relaxed),
            "done": entry.job.done(),
        }))
    }

    /// Per-provider progress map for a job.
    pub async fn job_progress(&self, id: &str) -> Result<HashMap<String, Value>, SchedulerError> {
        let entry = self.jobs.lock().await.get(id).cloned().ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        Ok(entry.job.progress())
    }

    /// Status of every registered pool, for monitoring.
    pub async fn pool_statuses(&self) -> PoolStatuses {
        let providers = self.pools.lock().await.values().map(|p| p.status()).collect();
        let cpu = match self.cpu_pool.lock().await.clone() {
            Some(pool) => Some(pool.status().await),
            None => None,
        };
        PoolStatuses { providers, cpu }
    }

    /// Number of jobs currently tracked in memory (active, not yet finalized).
    pub async fn active_job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterError, AdapterInfo, ChatApiRequest, LlmAdapter, OcrAdapter};
    use crate::job::PendingUnitInfo;
    use crate::store::{StoreOp, StoreOpResult};
    use crate::types::{ChatResult, OcrRequest, OcrResult, WorkPayload};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    struct InMemoryStore {
        counter: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for InMemoryStore {
        async fn execute(&self, _query_doc: &Value, _vars: &Value) -> Result<Value, crate::error::StoreError> {
            Ok(json!([]))
        }
        async fn create(&self, _collection: &str, _doc: &Value) -> Result<String, crate::error::StoreError> {
            Ok(format!("doc-{}", self.counter.fetch_add(1, Ordering::SeqCst)))
        }
        async fn apply(&self, ops: &[StoreOp]) -> Vec<StoreOpResult> {
            ops.iter().map(|_| StoreOpResult { doc_id: Some("x".into()), err: None }).collect()
        }
    }

    struct CountingOcr {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AdapterInfo for CountingOcr {
        fn name(&self) -> &str {
            "ocr-mock"
        }
        fn requests_per_second(&self) -> f64 {
            1000.0
        }
        fn max_concurrency(&self) -> usize {
            4
        }
    }

    #[async_trait]
    impl OcrAdapter for CountingOcr {
        async fn process_image(&self, _image_bytes: &[u8], page_num: u32) -> Result<OcrResult, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            Ok(OcrResult { text: format!("page {page_num}"), ..Default::default() })
        }
    }

    struct CountingLlm {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AdapterInfo for CountingLlm {
        fn name(&self) -> &str {
            "llm-mock"
        }
        fn requests_per_second(&self) -> f64 {
            100.0
        }
        fn max_concurrency(&self) -> usize {
            4
        }
    }

    #[async_trait]
    impl LlmAdapter for CountingLlm {
        async fn chat(&self, _req: ChatApiRequest) -> Result<ChatResult, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            Ok(ChatResult { provider: "llm-mock".into(), ..Default::default() })
        }
        async fn chat_with_tools(&self, req: ChatApiRequest, _tools: &[crate::types::ToolDescriptor]) -> Result<ChatResult, AdapterError> {
            self.chat(req).await
        }
    }

    struct MultiPhaseJob {
        record_id: StdMutex<Option<String>>,
        ocr_remaining: AtomicUsize,
        llm_remaining: AtomicUsize,
    }

    #[async_trait]
    impl Job for MultiPhaseJob {
        fn set_record_id(&self, id: String) {
            *self.record_id.lock().unwrap() = Some(id);
        }
        fn record_id(&self) -> Option<String> {
            self.record_id.lock().unwrap().clone()
        }
        fn job_type(&self) -> String {
            "multi_phase".into()
        }
        async fn start(&self, _ctx: &JobContext) -> Result<Vec<WorkUnit>, String> {
            let units = (0..3)
                .map(|i| WorkUnit::new(10, WorkPayload::Ocr(OcrRequest { image_bytes: vec![], page_num: i })))
                .collect();
            Ok(units)
        }
        async fn on_complete(&self, _ctx: &JobContext, result: WorkResult) -> Result<Vec<WorkUnit>, String> {
            match result.payload {
                Some(crate::types::ResultPayload::Ocr(_)) => {
                    self.ocr_remaining.fetch_sub(1, Ordering::SeqCst);
                    self.llm_remaining.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![WorkUnit::new(
                        10,
                        WorkPayload::Llm(crate::types::ChatRequest { messages: vec![], model: None }),
                    )])
                }
                Some(crate::types::ResultPayload::Llm(_)) => {
                    self.llm_remaining.fetch_sub(1, Ordering::SeqCst);
                    Ok(vec![])
                }
                _ => Ok(vec![]),
            }
        }
        fn done(&self) -> bool {
            self.ocr_remaining.load(Ordering::SeqCst) == 0 && self.llm_remaining.load(Ordering::SeqCst) == 0
        }
        fn pending_count(&self) -> usize {
            self.ocr_remaining.load(Ordering::SeqCst) + self.llm_remaining.load(Ordering::SeqCst)
        }
        fn progress(&self) -> HashMap<String, Value> {
            HashMap::new()
        }
    }

    fn _unused(_: PendingUnitInfo) {}

    #[tokio::test]
    async fn multi_phase_job_runs_ocr_then_llm_to_completion() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore { counter: AtomicUsize::new(0) });
        let sink = Arc::new(Sink::new(store.clone(), 10, std::time::Duration::from_secs(10)));
        sink.start().await;
        let scheduler = Scheduler::new(store, sink, None, "/tmp".into(), 100);

        let ocr = Arc::new(CountingOcr { calls: AtomicUsize::new(0) });
        let llm = Arc::new(CountingLlm { calls: AtomicU32::new(0) });
        scheduler
            .register_pool("ocr-mock", ProviderHandle::Ocr(ocr.clone()), crate::config::PoolConfig { capacity: 100.0, rps: 100.0, ..Default::default() })
            .await;
        scheduler
            .register_pool("llm-mock", ProviderHandle::Llm(llm.clone()), crate::config::PoolConfig { capacity: 100.0, rps: 100.0, ..Default::default() })
            .await;

        let runner = scheduler.clone();
        let run_handle = tokio::spawn(async move { runner.run().await });

        let job = Arc::new(MultiPhaseJob {
            record_id: StdMutex::new(None),
            ocr_remaining: AtomicUsize::new(3),
            llm_remaining: AtomicUsize::new(0),
        });
        let id = scheduler.submit(job).await.unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if scheduler.jobs.lock().await.get(&id).is_none() {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("job did not complete in time");
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(ocr.calls.load(Ordering::SeqCst), 3);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);

        scheduler.cancellation_token().cancel();
        let _ = run_handle.await;
    }

    #[tokio::test]
    async fn no_matching_pool_synthesises_failures() {
        struct TwoOcrJob {
            record_id: StdMutex<Option<String>>,
            failures: AtomicUsize,
        }

        #[async_trait]
        impl Job for TwoOcrJob {
            fn set_record_id(&self, id: String) {
                *self.record_id.lock().unwrap() = Some(id);
            }
            fn record_id(&self) -> Option<String> {
                self.record_id.lock().unwrap().clone()
            }
            fn job_type(&self) -> String {
                "two_ocr".into()
            }
            async fn start(&self, _ctx: &JobContext) -> Result<Vec<WorkUnit>, String> {
                Ok((0..2)
                    .map(|i| WorkUnit::new(10, WorkPayload::Ocr(OcrRequest { image_bytes: vec![], page_num: i })))
                    .collect())
            }
            async fn on_complete(&self, _ctx: &JobContext, result: WorkResult) -> Result<Vec<WorkUnit>, String> {
                if !result.success {
                    self.failures.fetch_add(1, Ordering::SeqCst);
                }
                Ok(vec![])
            }
            fn done(&self) -> bool {
                self.failures.load(Ordering::SeqCst) == 2
            }
            fn pending_count(&self) -> usize {
                0
            }
            fn progress(&self) -> HashMap<String, Value> {
                HashMap::new()
            }
        }

        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore { counter: AtomicUsize::new(0) });
        let sink = Arc::new(Sink::new(store.clone(), 10, std::time::Duration::from_secs(10)));
        sink.start().await;
        let scheduler = Scheduler::new(store, sink, None, "/tmp".into(), 100);
        let llm = Arc::new(CountingLlm { calls: AtomicU32::new(0) });
        scheduler
            .register_pool("llm-mock", ProviderHandle::Llm(llm), crate::config::PoolConfig { capacity: 100.0, rps: 100.0, ..Default::default() })
            .await;

        let runner = scheduler.clone();
        let run_handle = tokio::spawn(async move { runner.run().await });

        let job = Arc::new(TwoOcrJob { record_id: StdMutex::new(None), failures: AtomicUsize::new(0) });
        scheduler.submit(job).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert_eq!(scheduler.active_job_count().await, 0);

        scheduler.cancellation_token().cancel();
        let _ = run_handle.await;
    }

    #[tokio::test]
    async fn synchronous_job_completes_immediately() {
        struct SyncJob {
            record_id: StdMutex<Option<String>>,
        }
        #[async_trait]
        impl Job for SyncJob {
            fn set_record_id(&self, id: String) {
                *self.record_id.lock().unwrap() = Some(id);
            }
            fn record_id(&self) -> Option<String> {
                self.record_id.lock().unwrap().clone()
            }
            fn job_type(&self) -> String {
                "sync".into()
            }
            async fn start(&self, _ctx: &JobContext) -> Result<Vec<WorkUnit>, String> {
                Ok(vec![])
            }
            async fn on_complete(&self, _ctx: &JobContext, _result: WorkResult) -> Result<Vec<WorkUnit>, String> {
                Ok(vec![])
            }
            fn done(&self) -> bool {
                true
            }
            fn pending_count(&self) -> usize {
                0
            }
            fn progress(&self) -> HashMap<String, Value> {
                HashMap::new()
            }
        }

        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore { counter: AtomicUsize::new(0) });
        let sink = Arc::new(Sink::new(store.clone(), 10, std::time::Duration::from_secs(10)));
        sink.start().await;
        let scheduler = Scheduler::new(store, sink, None, "/tmp".into(), 100);
        let job = Arc::new(SyncJob { record_id: StdMutex::new(None) });
        scheduler.submit(job).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(scheduler.active_job_count().await, 0);
    }

    struct PinnedJob {
        record_id: StdMutex<Option<String>>,
        remaining: AtomicUsize,
    }

    #[async_trait]
    impl Job for PinnedJob {
        fn set_record_id(&self, id: String) {
            *self.record_id.lock().unwrap() = Some(id);
        }
        fn record_id(&self) -> Option<String> {
            self.record_id.lock().unwrap().clone()
        }
        fn job_type(&self) -> String {
            "pinned".into()
        }
        async fn start(&self, _ctx: &JobContext) -> Result<Vec<WorkUnit>, String> {
            Ok((0..3)
                .map(|_| {
                    WorkUnit::new(10, WorkPayload::Llm(crate::types::ChatRequest { messages: vec![], model: None }))
                        .with_provider("llm-2")
                })
                .collect())
        }
        async fn on_complete(&self, _ctx: &JobContext, _result: WorkResult) -> Result<Vec<WorkUnit>, String> {
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![])
        }
        fn done(&self) -> bool {
            self.remaining.load(Ordering::SeqCst) == 0
        }
        fn pending_count(&self) -> usize {
            self.remaining.load(Ordering::SeqCst)
        }
        fn progress(&self) -> HashMap<String, Value> {
            HashMap::new()
        }
    }

    #[tokio::test]
    async fn provider_pinning_routes_all_units_to_the_named_pool() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore { counter: AtomicUsize::new(0) });
        let sink = Arc::new(Sink::new(store.clone(), 10, std::time::Duration::from_secs(10)));
        sink.start().await;
        let scheduler = Scheduler::new(store, sink, None, "/tmp".into(), 100);

        let llm1 = Arc::new(CountingLlm { calls: AtomicU32::new(0) });
        let llm2 = Arc::new(CountingLlm { calls: AtomicU32::new(0) });
        scheduler
            .register_pool("llm-1", ProviderHandle::Llm(llm1.clone()), crate::config::PoolConfig { capacity: 100.0, rps: 100.0, ..Default::default() })
            .await;
        scheduler
            .register_pool("llm-2", ProviderHandle::Llm(llm2.clone()), crate::config::PoolConfig { capacity: 100.0, rps: 100.0, ..Default::default() })
            .await;

        let runner = scheduler.clone();
        let run_handle = tokio::spawn(async move { runner.run().await });

        let job = Arc::new(PinnedJob { record_id: StdMutex::new(None), remaining: AtomicUsize::new(3) });
        let id = scheduler.submit(job).await.unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if scheduler.jobs.lock().await.get(&id).is_none() {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("job did not complete in time");
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(llm2.calls.load(Ordering::SeqCst), 3);
        assert_eq!(llm1.calls.load(Ordering::SeqCst), 0);

        scheduler.cancellation_token().cancel();
        let _ = run_handle.await;
    }

    struct FakeManager {
        records: StdMutex<HashMap<String, JobRecord>>,
    }

    #[async_trait]
    impl JobManager for FakeManager {
        async fn create(&self, mut record: JobRecord) -> Result<JobRecord, crate::error::StoreError> {
            record.id = format!("job-{}", self.records.lock().unwrap().len());
            self.records.lock().unwrap().insert(record.id.clone(), record.clone());
            Ok(record)
        }
        async fn set_status(&self, id: &str, status: JobStatus, error: Option<String>) -> Result<(), crate::error::StoreError> {
            if let Some(record) = self.records.lock().unwrap().get_mut(id) {
                record.status = status;
                record.error = error;
            }
            Ok(())
        }
        async fn list_running(&self) -> Result<Vec<JobRecord>, crate::error::StoreError> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|r| matches!(r.status, JobStatus::Running))
                .cloned()
                .collect())
        }
    }

    /// Mirrors how a resumed OCR/TTS job skips already-done units: `start`
    /// only emits the units still outstanding against persisted substate,
    /// here modelled as `remaining` rather than a real store query.
    struct ResumableJob {
        record_id: StdMutex<Option<String>>,
        remaining: AtomicUsize,
        completed: AtomicUsize,
    }

    #[async_trait]
    impl Job for ResumableJob {
        fn set_record_id(&self, id: String) {
            *self.record_id.lock().unwrap() = Some(id);
        }
        fn record_id(&self) -> Option<String> {
            self.record_id.lock().unwrap().clone()
        }
        fn job_type(&self) -> String {
            "resumable".into()
        }
        async fn start(&self, _ctx: &JobContext) -> Result<Vec<WorkUnit>, String> {
            let n = self.remaining.load(Ordering::SeqCst);
            Ok((0..n)
                .map(|i| WorkUnit::new(10, WorkPayload::Ocr(OcrRequest { image_bytes: vec![], page_num: i as u32 })))
                .collect())
        }
        async fn on_complete(&self, _ctx: &JobContext, _result: WorkResult) -> Result<Vec<WorkUnit>, String> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
        fn done(&self) -> bool {
            self.completed.load(Ordering::SeqCst) >= self.remaining.load(Ordering::SeqCst)
        }
        fn pending_count(&self) -> usize {
            self.remaining.load(Ordering::SeqCst) - self.completed.load(Ordering::SeqCst)
        }
        fn progress(&self) -> HashMap<String, Value> {
            HashMap::new()
        }
    }

    #[tokio::test]
    async fn resume_rebuilds_a_running_job_via_its_factory() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore { counter: AtomicUsize::new(0) });
        let sink = Arc::new(Sink::new(store.clone(), 10, std::time::Duration::from_secs(10)));
        sink.start().await;

        let manager = Arc::new(FakeManager { records: StdMutex::new(HashMap::new()) });
        let mut seeded = JobRecord::new("resumable", Some("book-1".into()));
        seeded.id = "job-running-1".into();
        seeded.status = JobStatus::Running;
        manager.records.lock().unwrap().insert(seeded.id.clone(), seeded);

        let scheduler = Scheduler::new(store, sink, Some(manager.clone() as Arc<dyn JobManager>), "/tmp".into(), 100);

        let ocr = Arc::new(CountingOcr { calls: AtomicUsize::new(0) });
        scheduler
            .register_pool("ocr-mock", ProviderHandle::Ocr(ocr.clone()), crate::config::PoolConfig { capacity: 100.0, rps: 100.0, ..Default::default() })
            .await;

        // Only one of the two original units remains outstanding, mirroring
        // a resume against a job that had already finished one page.
        scheduler
            .register_factory(
                "resumable",
                Arc::new(|_book_id| -> Arc<dyn Job> {
                    Arc::new(ResumableJob {
                        record_id: StdMutex::new(None),
                        remaining: AtomicUsize::new(1),
                        completed: AtomicUsize::new(0),
                    })
                }),
            )
            .await;

        let runner = scheduler.clone();
        let run_handle = tokio::spawn(async move { runner.run().await });

        let resumed = scheduler.resume().await.unwrap();
        assert_eq!(resumed, 1);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if scheduler.active_job_count().await == 0 {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("resumed job did not complete in time");
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.records.lock().unwrap().get("job-running-1").unwrap().status,
            JobStatus::Completed
        ));

        scheduler.cancellation_token().cancel();
        let _ = run_handle.await;
    }
}
