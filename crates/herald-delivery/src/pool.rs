//! Fixed-size worker pool over a shared bounded work queue.
//!
//! Every per-device send in the gateway runs through one shared pool;
//! callback deliveries run through a second, smaller one. Producers
//! enqueue opaque [`WorkItem`]s; `n` supervised tokio tasks drain the
//! queue in enqueue order and execute items serially per worker,
//! concurrently across workers. An awaiting bounded send gives natural
//! backpressure when the queue is full.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Opaque unit of work executed by the pool.
///
/// The return value is advisory: it is logged, and failed items are never
/// rescheduled.
#[async_trait]
pub trait WorkItem: Send + 'static {
    /// Runs the item to completion.
    async fn execute(self: Box<Self>) -> bool;
}

/// Fixed pool of workers draining a shared bounded queue.
pub struct WorkerPool {
    tx: mpsc::Sender<Box<dyn WorkItem>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Box<dyn WorkItem>>>>,
    worker_count: usize,
    closed: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool of `worker_count` workers with a queue of capacity
    /// `2 * worker_count`. Workers do not run until [`start`](Self::start).
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (tx, rx) = mpsc::channel(worker_count * 2);
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            worker_count,
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker tasks. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(worker_count = self.worker_count, "starting worker pool");

        let mut handles = self.handles.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for worker_id in 0..self.worker_count {
            let rx = self.rx.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                debug!(worker_id, "worker started");
                loop {
                    // Hold the receiver lock only while waiting; execution
                    // happens with the queue free for the other workers.
                    let item = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            () = cancel.cancelled() => None,
                            item = rx.recv() => item,
                        }
                    };
                    let Some(item) = item else { break };
                    if !item.execute().await {
                        debug!(worker_id, "work item reported failure");
                    }
                }
                debug!(worker_id, "worker stopped");
            }));
        }
    }

    /// Schedules a work item, awaiting queue capacity if necessary.
    ///
    /// Returns `false` once the pool has been stopped; the item is dropped
    /// in that case.
    pub async fn enqueue(&self, item: Box<dyn WorkItem>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(item).await.is_ok()
    }

    /// Stops the pool: refuses new work, signals every worker to quit,
    /// waits for in-flight items to complete, then closes the queue.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(worker_count = self.worker_count, "stopping worker pool");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard =
                self.handles.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(join_error) = handle.await {
                error!(error = %join_error, "worker task panicked during shutdown");
            }
        }

        // Close the queue and drop whatever never ran, so item-held
        // resources (result senders in particular) are released.
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            info!(dropped, "discarded queued items during shutdown");
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Backstop for pools dropped without stop(): cancel the workers so
        // they do not outlive the queue.
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
        }
    }
}
