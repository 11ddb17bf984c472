//! WorkerPool - a fixed set of workers draining one priority queue.
//!
//! One pool per priority tier; pools share nothing but the executor, so a
//! saturated background pool never delays high-priority work.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::queue::PoolQueue;
use super::worker_loop::{Executor, worker_loop};
use crate::config::PoolConfig;
use crate::domain::Priority;

/// Worker pool handle.
/// - `request_shutdown()` stops workers from taking new tasks
/// - in-flight handlers are cancelled through their own tokens, not here
pub struct WorkerPool {
    priority: Priority,
    workers: usize,
    queue: Arc<PoolQueue>,
    shutdown: CancellationToken,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers.
    pub(crate) fn spawn(priority: Priority, config: PoolConfig, executor: Arc<Executor>) -> Self {
        if config.workers == 0 {
            warn!(%priority, "pool configured with zero workers; its tasks will never run");
        }
        let queue = Arc::new(PoolQueue::new(priority, config.queue_capacity, config.workers));
        let shutdown = CancellationToken::new();

        let mut joins = Vec::with_capacity(config.workers);
        for n in 0..config.workers {
            let name = format!("{priority}-{n}");
            let q = Arc::clone(&queue);
            let ex = Arc::clone(&executor);
            let token = shutdown.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(name, q, ex, token).await;
            }));
        }
        info!(%priority, workers = config.workers, capacity = config.queue_capacity, "pool started");

        Self {
            priority,
            workers: config.workers,
            queue,
            shutdown,
            joins: Mutex::new(joins),
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Tasks waiting for a worker.
    pub async fn queue_depth(&self) -> usize {
        self.queue.len().await
    }

    pub(crate) fn queue(&self) -> &PoolQueue {
        &self.queue
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Take the worker join handles. Second and later calls return nothing.
    pub(crate) fn take_joins(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.joins.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
