//! WorkerLoop - task execution loop.
//!
//! # Flow
//! 1. `PoolQueue::pop()` yields a task id
//! 2. `TaskTable::begin()` moves it Queued -> Running (skipped if cancelled meanwhile)
//! 3. the handler is resolved and run inside a panic boundary
//! 4. the outcome becomes Completed / Failed / Cancelled
//! 5. every transition is saved to the `TaskStore`; the record retires from
//!    the live table once its terminal save succeeds, and is retried after
//!    every later task otherwise

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::PoolQueue;
use super::table::TaskTable;
use crate::domain::{TaskId, TaskRecord};
use crate::ports::{Clock, TaskStore};
use crate::typed::{HandlerRegistry, ProgressReporter, ProgressSink, TaskContext, TaskError};

/// How one execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExecutionOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl ExecutionOutcome {
    fn from_result(result: Result<Result<(), TaskError>, Box<dyn Any + Send>>) -> Self {
        match result {
            Ok(Ok(())) => Self::Completed,
            Ok(Err(TaskError::Cancelled)) => Self::Cancelled,
            Ok(Err(TaskError::Failed(message))) => Self::Failed(message),
            Ok(Err(e @ TaskError::Payload(_))) => Self::Failed(e.to_string()),
            Err(panic) => Self::Failed(format!("handler panicked: {}", panic_message(&*panic))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// State shared by every worker of every pool.
pub(crate) struct Executor {
    registry: Arc<HandlerRegistry>,
    table: Arc<TaskTable>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    progress_interval: Duration,
}

impl Executor {
    pub(crate) fn new(
        registry: Arc<HandlerRegistry>,
        table: Arc<TaskTable>,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            registry,
            table,
            store,
            clock,
            progress_interval,
        }
    }

    /// Run one dequeued task to a terminal state.
    pub(crate) async fn run_one(self: &Arc<Self>, worker: &str, task_id: TaskId) {
        let Some((record, token)) = self.table.begin(task_id, self.clock.now()) else {
            debug!(%task_id, worker, "dequeued task not started (cancelled or shutting down)");
            return;
        };
        self.persist(&record).await;
        info!(
            %task_id,
            task_type = %record.task_type,
            priority = %record.priority,
            worker,
            "task started"
        );

        let outcome = self.execute(&record, token).await;

        let Some(done) = self.table.finish(task_id, &outcome, self.clock.now()) else {
            warn!(%task_id, ?outcome, "running task vanished before it finished");
            return;
        };
        self.retire(&done).await;

        match &outcome {
            ExecutionOutcome::Completed => {
                info!(%task_id, task_type = %done.task_type, worker, "task completed")
            }
            ExecutionOutcome::Cancelled => {
                info!(%task_id, task_type = %done.task_type, worker, "task cancelled")
            }
            ExecutionOutcome::Failed(e) => {
                warn!(%task_id, task_type = %done.task_type, worker, error = %e, "task failed")
            }
        }
    }

    async fn execute(self: &Arc<Self>, record: &TaskRecord, token: CancellationToken) -> ExecutionOutcome {
        let Some(handler) = self.registry.resolve(&record.task_type) else {
            // Submit rejects unknown types, so only a store edited behind our back gets here.
            return ExecutionOutcome::Failed(format!(
                "no handler registered for task_type={}",
                record.task_type
            ));
        };
        let ctx = TaskContext::new(record.id, token);
        let sink: Arc<dyn ProgressSink> = Arc::clone(self) as Arc<dyn ProgressSink>;
        let progress = ProgressReporter::new(record.id, sink);

        let result = AssertUnwindSafe(handler.execute(&ctx, record, &progress))
            .catch_unwind()
            .await;
        if result.is_err() {
            warn!(task_id = %record.id, task_type = %record.task_type, "handler panicked");
        }
        ExecutionOutcome::from_result(result)
    }

    /// Save a terminal record and drop it from the live table. On a store
    /// error it stays live, so status and cancel keep seeing the final state.
    pub(crate) async fn retire(&self, record: &TaskRecord) -> bool {
        match self.store.save(record).await {
            Ok(()) => {
                self.table.remove(record.id);
                true
            }
            Err(e) => {
                warn!(task_id = %record.id, state = %record.state, error = %e, "failed to persist terminal record; keeping it live");
                false
            }
        }
    }

    /// Retry the final save of records an earlier `retire` could not store.
    pub(crate) async fn flush_unsaved(&self) -> usize {
        let mut left = 0;
        for record in self.table.unsaved() {
            if !self.retire(&record).await {
                left += 1;
            }
        }
        left
    }

    async fn persist(&self, record: &TaskRecord) {
        if let Err(e) = self.store.save(record).await {
            warn!(task_id = %record.id, state = %record.state, error = %e, "failed to persist task record");
        }
    }
}

#[async_trait]
impl ProgressSink for Executor {
    async fn report(&self, task_id: TaskId, percent: u8, message: Option<String>) {
        if let Some(snapshot) = self
            .table
            .progress(task_id, percent, message, self.progress_interval)
        {
            self.persist(&snapshot).await;
        }
    }
}

pub(crate) async fn worker_loop(
    name: String,
    queue: Arc<PoolQueue>,
    executor: Arc<Executor>,
    shutdown: CancellationToken,
) {
    debug!(worker = %name, "worker started");
    loop {
        let task_id = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            task_id = queue.pop() => task_id,
        };
        executor.run_one(&name, task_id).await;
        queue.release().await;
        executor.flush_unsaved().await;
    }
    debug!(worker = %name, "worker stopped");
}
