//! CPU worker pool: N workers sharing one FIFO channel, dispatched by task name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::error::PoolError;
use crate::types::{CpuRequest, ResultPayload, WorkResult, WorkUnit};

/// A registered handler for one CPU task name.
///
/// Handlers must be safe for concurrent invocation: the pool's workers call
/// the same handler instance from multiple tasks at once.
pub type CpuTaskHandler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

type HandlerRegistry = Arc<RwLock<HashMap<String, CpuTaskHandler>>>;

/// Live status of a [`CpuPool`], for the scheduler's monitoring surface.
#[derive(Debug, Clone)]
pub struct CpuPoolStatus {
    /// Pool name (conventionally `"cpu"`).
    pub name: String,
    /// Configured worker count.
    pub workers: usize,
    /// Units currently executing.
    pub in_flight: usize,
    /// Registered task names.
    pub tasks: Vec<String>,
}

/// N workers pulling from one bounded FIFO channel, dispatching by task name.
///
/// Handlers may be registered any time after [`CpuPool::start`] via
/// [`CpuPool::register_handler`]; workers read the registry fresh on every
/// dispatch.
pub struct CpuPool {
    name: String,
    sender: mpsc::Sender<WorkUnit>,
    handlers: HandlerRegistry,
    in_flight: Arc<AtomicUsize>,
    worker_count: usize,
    workers: Vec<JoinHandle<()>>,
}

impl CpuPool {
    /// Start a pool with `worker_count` workers (0 defaults to available
    /// parallelism) and a channel buffered to `worker_count`. `results`
    /// receives one [`WorkResult`] per finished unit; `token` stops all
    /// workers on cancellation.
    pub fn start(
        name: impl Into<String>,
        worker_count: usize,
        results: mpsc::Sender<WorkResult>,
        token: CancellationToken,
    ) -> Self {
        let name = name.into();
        let worker_count = if worker_count == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            worker_count
        };
        let (sender, receiver) = mpsc::channel(worker_count);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handlers: HandlerRegistry = Arc::new(RwLock::new(HashMap::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let receiver = receiver.clone();
            let handlers = handlers.clone();
            let in_flight = in_flight.clone();
            let results = results.clone();
            let token = token.clone();
            let pool_name = name.clone();
            workers.push(tokio::spawn(async move {
                run_cpu_worker(pool_name, worker_id, receiver, handlers, in_flight, results, token).await
            }));
        }

        Self { name, sender, handlers, in_flight, worker_count, workers }
    }

    /// Register (or replace) the handler for `task`.
    pub async fn register_handler(&self, task: impl Into<String>, handler: CpuTaskHandler) {
        self.handlers.write().await.insert(task.into(), handler);
    }

    /// Submit a unit for execution. Returns [`PoolError::WorkerQueueFull`] if
    /// the channel is at capacity, or [`PoolError::KindMismatch`] if the unit
    /// is not a CPU unit.
    pub fn submit(&self, unit: WorkUnit) -> Result<(), PoolError> {
        if unit.kind() != crate::types::WorkKind::Cpu {
            return Err(PoolError::KindMismatch { expected: crate::types::WorkKind::Cpu, actual: unit.kind() });
        }
        self.sender
            .try_send(unit)
            .map_err(|_| PoolError::WorkerQueueFull { pool: self.name.clone() })
    }

    /// Current status snapshot.
    pub async fn status(&self) -> CpuPoolStatus {
        CpuPoolStatus {
            name: self.name.clone(),
            workers: self.worker_count,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            tasks: self.handlers.read().await.keys().cloned().collect(),
        }
    }

    /// Await all worker tasks, e.g. during a graceful shutdown sequence.
    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[instrument(skip(receiver, handlers, in_flight, results, token), fields(pool = %pool_name, worker = worker_id))]
async fn run_cpu_worker(
    pool_name: String,
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkUnit>>>,
    handlers: HandlerRegistry,
    in_flight: Arc<AtomicUsize>,
    results: mpsc::Sender<WorkResult>,
    token: CancellationToken,
) {
    loop {
        let unit = {
            let mut guard = receiver.lock().await;
            tokio::select! {
                unit = guard.recv() => unit,
                _ = token.cancelled() => None,
            }
        };
        let Some(unit) = unit else {
            return;
        };
        in_flight.fetch_add(1, Ordering::Relaxed);
        let result = execute_cpu_unit(&handlers, &unit).await;
        in_flight.fetch_sub(1, Ordering::Relaxed);
        if let Err(err) = &result {
            error!(unit_id = %unit.id, error = %err, "cpu task failed");
        } else {
            info!(unit_id = %unit.id, "cpu task completed");
        }
        let work_result = match result {
            Ok(value) => WorkResult::success(&unit, ResultPayload::Cpu(value)),
            Err(err) => WorkResult::failure(&unit, err),
        };
        if results.send(work_result).await.is_err() {
            return;
        }
    }
}

async fn execute_cpu_unit(handlers: &HandlerRegistry, unit: &WorkUnit) -> Result<Value, String> {
    let crate::types::WorkPayload::Cpu(CpuRequest { task, data }) = &unit.payload else {
        return Err("unit payload is not a cpu request".into());
    };
    let handler = handlers
        .read()
        .await
        .get(task)
        .cloned()
        .ok_or_else(|| PoolError::UnknownTask { task: task.clone() }.to_string())?;
    handler(data.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkPayload;
    use serde_json::json;

    fn cpu_unit(task: &str, data: Value) -> WorkUnit {
        WorkUnit::new(10, WorkPayload::Cpu(CpuRequest { task: task.into(), data }))
    }

    #[tokio::test]
    async fn dispatches_registered_handler() {
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let pool = CpuPool::start("cpu", 2, tx, token.clone());
        pool.register_handler("double", Arc::new(|v: Value| Ok(json!(v.as_i64().unwrap_or(0) * 2))))
            .await;
        pool.submit(cpu_unit("double", json!(21))).unwrap();
        let result = rx.recv().await.unwrap();
        assert!(result.success);
        token.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn unknown_task_is_a_failure_result() {
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let pool = CpuPool::start("cpu", 1, tx, token.clone());
        pool.submit(cpu_unit("missing", json!(null))).unwrap();
        let result = rx.recv().await.unwrap();
        assert!(!result.success);
        token.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn submit_rejects_non_cpu_units() {
        let (tx, _rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let pool = CpuPool::start("cpu", 1, tx, token.clone());
        let llm_unit = WorkUnit::new(
            10,
            WorkPayload::Llm(crate::types::ChatRequest { messages: vec![], model: None }),
        );
        assert!(matches!(pool.submit(llm_unit), Err(PoolError::KindMismatch { .. })));
        token.cancel();
        pool.join().await;
    }
}
