//! Write-through batching sink in front of a [`DocumentStore`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SinkError;
use crate::store::{DocumentStore, StoreOp, StoreOpResult};

struct QueuedOp {
    op: StoreOp,
    waiter: Option<oneshot::Sender<StoreOpResult>>,
}

struct Buffer {
    ops: Vec<QueuedOp>,
    first_queued_at: Option<Instant>,
}

impl Buffer {
    fn new() -> Self {
        Self { ops: Vec::new(), first_queued_at: None }
    }

    fn push(&mut self, op: QueuedOp) {
        if self.ops.is_empty() {
            self.first_queued_at = Some(Instant::now());
        }
        self.ops.push(op);
    }

    fn take(&mut self) -> Vec<QueuedOp> {
        self.first_queued_at = None;
        std::mem::take(&mut self.ops)
    }
}

/// Batches writes to a [`DocumentStore`], flushing on size, interval, or
/// explicit request. Fire-and-forget callers use [`Sink::send`]; callers
/// that need the assigned doc id use [`Sink::send_sync`]/[`send_many_sync`].
pub struct Sink {
    store: Arc<dyn DocumentStore>,
    buffer: Arc<Mutex<Buffer>>,
    batch_size: usize,
    flush_interval: Duration,
    stopped: Arc<AtomicBool>,
    token: CancellationToken,
    flush_notify: Arc<tokio::sync::Notify>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Sink {
    /// Construct a sink over `store`, not yet started.
    pub fn new(store: Arc<dyn DocumentStore>, batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            store,
            buffer: Arc::new(Mutex::new(Buffer::new())),
            batch_size: batch_size.max(1),
            flush_interval,
            stopped: Arc::new(AtomicBool::new(false)),
            token: CancellationToken::new(),
            flush_notify: Arc::new(tokio::sync::Notify::new()),
            flusher: Mutex::new(None),
        }
    }

    /// Start the background flusher task. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.flusher.lock().await;
        if guard.is_some() {
            return;
        }
        let this = self.clone();
        *guard = Some(tokio::spawn(async move { this.run_flusher().await }));
    }

    async fn run_flusher(self: Arc<Self>) {
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush_now().await,
                _ = self.flush_notify.notified() => self.flush_now().await,
                _ = self.token.cancelled() => {
                    self.flush_now().await;
                    return;
                }
            }
        }
    }

    async fn flush_now(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            buffer.take()
        };
        if batch.is_empty() {
            return;
        }
        debug!(count = batch.len(), "flushing sink batch");
        let ops: Vec<StoreOp> = batch.iter().map(|q| q.op.clone()).collect();
        let results = self.store.apply(&ops).await;
        for (queued, result) in batch.into_iter().zip(results.into_iter()) {
            if let Some(err) = &result.err {
                warn!(source = %queued.op.source, error = %err, "sink op failed");
            }
            if let Some(waiter) = queued.waiter {
                let _ = waiter.send(result);
            }
        }
    }

    async fn enqueue(&self, op: StoreOp, waiter: Option<oneshot::Sender<StoreOpResult>>) -> Result<(), SinkError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SinkError::Stopped);
        }
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(QueuedOp { op, waiter });
            buffer.ops.len() >= self.batch_size
        };
        if should_flush {
            self.flush_notify.notify_one();
        }
        Ok(())
    }

    /// Enqueue `op`, not waiting for it to apply.
    pub async fn send(&self, op: StoreOp) -> Result<(), SinkError> {
        self.enqueue(op, None).await
    }

    /// Enqueue `op` and wait until it has been applied (or the sink is stopped).
    pub async fn send_sync(&self, op: StoreOp) -> Result<StoreOpResult, SinkError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(op, Some(tx)).await?;
        rx.await.map_err(|_| SinkError::Cancelled)
    }

    /// Enqueue `ops` as a batch and wait for all of them, in submission order.
    pub async fn send_many_sync(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreOpResult>, SinkError> {
        let mut receivers = Vec::with_capacity(ops.len());
        for op in ops {
            let (tx, rx) = oneshot::channel();
            self.enqueue(op, Some(tx)).await?;
            receivers.push(rx);
        }
        let mut out = Vec::with_capacity(receivers.len());
        for rx in receivers {
            out.push(rx.await.map_err(|_| SinkError::Cancelled)?);
        }
        Ok(out)
    }

    /// Force an immediate drain of whatever is currently buffered.
    pub async fn flush(&self) {
        self.flush_now().await;
    }

    /// Stop the flusher, draining any remaining buffered ops first.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.token.cancel();
        if let Some(handle) = self.flusher.lock().await.take() {
            let _ = handle.await;
        }
    }
}
