//! Dispatcher - the caller-facing surface of the engine.
//!
//! Routes submissions to the pool for their priority, answers status
//! queries from the live table (falling back to the store for retired
//! records), cancels tasks and drives shutdown and start-up recovery.
//!
//! Lock order: a pool queue lock may be held while taking the table lock,
//! never the other way around.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::pool::WorkerPool;
use super::status::{EngineStatus, PoolStatus, RecoveryReport, ShutdownReport, TaskCounts};
use super::table::{CancelOutcome, TaskTable};
use super::worker_loop::Executor;
use crate::config::EngineConfig;
use crate::domain::{
    DefinitionId, EngineError, NewTask, Priority, TaskId, TaskRecord, TaskState, TaskType,
};
use crate::ports::{Clock, IdGenerator, TaskFilter, TaskStore};
use crate::typed::{HandlerRegistry, PayloadCodec, Task};

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    /// Indexed by `Priority::index()`.
    pools: [WorkerPool; 3],
    table: Arc<TaskTable>,
    executor: Arc<Executor>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    accepting: AtomicBool,
}

impl Dispatcher {
    /// Spawn one worker pool per priority and start accepting work.
    pub(crate) fn start(
        registry: Arc<HandlerRegistry>,
        config: &EngineConfig,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let table = Arc::new(TaskTable::new());
        let executor = Arc::new(Executor::new(
            Arc::clone(&registry),
            Arc::clone(&table),
            Arc::clone(&store),
            Arc::clone(&clock),
            config.progress_persist_interval(),
        ));
        let pools = Priority::ALL
            .map(|p| WorkerPool::spawn(p, config.pools.get(p), Arc::clone(&executor)));

        Self {
            registry,
            pools,
            table,
            executor,
            store,
            clock,
            ids,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn pool(&self, priority: Priority) -> &WorkerPool {
        &self.pools[priority.index()]
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.registry.registered_types()
    }

    /// Create a Queued record and enqueue it on its priority pool.
    ///
    /// Rejected, with nothing recorded, when the engine is shutting down,
    /// the task type has no handler or the pool queue is full.
    ///
    /// The record is saved before the queue is locked. If another submitter
    /// takes the last place meanwhile, the saved record is Cancelled with the
    /// rejection as its error and `QueueFull` is returned.
    pub async fn submit(&self, new: NewTask) -> Result<TaskId, EngineError> {
        if !self.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }
        if !self.registry.contains(&new.task_type) {
            return Err(EngineError::UnknownHandler(new.task_type));
        }

        let queue = self.pool(new.priority).queue();
        queue.ensure_room().await?;

        let mut record = TaskRecord::new(self.ids.generate_task_id(), new, self.clock.now());
        let task_id = record.id;
        self.store.save(&record).await?;

        let slot = match queue.reserve().await {
            Ok(slot) => slot,
            Err(e) => {
                if record.abandon(e.to_string(), self.clock.now()).is_ok()
                    && let Err(save) = self.store.save(&record).await
                {
                    warn!(%task_id, error = %save, "failed to persist rejected submission");
                }
                debug!(%task_id, error = %e, "queue filled while saving; submission rolled back");
                return Err(e);
            }
        };
        debug!(
            %task_id,
            task_type = %record.task_type,
            priority = %record.priority,
            trigger = ?record.trigger,
            "task queued"
        );
        self.table.insert(record);
        slot.commit(task_id);
        Ok(task_id)
    }

    /// Submit a manual task.
    pub async fn submit_manual(
        &self,
        task_type: impl Into<TaskType>,
        priority: Priority,
        payload: serde_json::Value,
    ) -> Result<TaskId, EngineError> {
        self.submit(NewTask::manual(task_type, priority, payload)).await
    }

    /// Submit a typed task under `T::TYPE`.
    pub async fn submit_typed<T: Task>(
        &self,
        task: &T,
        priority: Priority,
    ) -> Result<TaskId, EngineError> {
        let payload = PayloadCodec::encode(task).map_err(|e| EngineError::InvalidPayload {
            task_type: TaskType::new(T::TYPE),
            message: e.to_string(),
        })?;
        self.submit_manual(T::TYPE, priority, payload).await
    }

    /// Cancel a task.
    ///
    /// Queued tasks become Cancelled immediately and never run. Running
    /// tasks get their cancellation signalled and stay Running until the
    /// handler returns. Terminal tasks yield `AlreadyTerminal`.
    pub async fn cancel(&self, task_id: TaskId) -> Result<(), EngineError> {
        match self.table.request_cancel(task_id, self.clock.now()) {
            CancelOutcome::Dequeued(record) => {
                self.pool(record.priority).queue().remove(task_id).await;
                self.executor.retire(&record).await;
                info!(%task_id, task_type = %record.task_type, "queued task cancelled");
                Ok(())
            }
            CancelOutcome::Signalled => {
                info!(%task_id, "cancellation signalled to running task");
                Ok(())
            }
            CancelOutcome::Terminal(state) => Err(EngineError::AlreadyTerminal { id: task_id, state }),
            CancelOutcome::Missing => match self.store.load(task_id).await? {
                Some(record) if record.is_terminal() => Err(EngineError::AlreadyTerminal {
                    id: task_id,
                    state: record.state,
                }),
                _ => Err(EngineError::NotFound(task_id)),
            },
        }
    }

    /// Current snapshot of a task.
    pub async fn status(&self, task_id: TaskId) -> Result<TaskRecord, EngineError> {
        if let Some(record) = self.table.snapshot(task_id) {
            return Ok(record);
        }
        self.store
            .load(task_id)
            .await?
            .ok_or(EngineError::NotFound(task_id))
    }

    /// Every task in `state`, oldest first.
    pub async fn list_by_status(&self, state: TaskState) -> Result<Vec<TaskRecord>, EngineError> {
        let mut records: Vec<TaskRecord> = self
            .table
            .snapshots()
            .into_iter()
            .filter(|r| r.state == state)
            .collect();
        let live: HashSet<TaskId> = records.iter().map(|r| r.id).collect();
        let stored = self.store.query(&TaskFilter::with_state(state)).await?;
        // the live table is newer than the store for ids it holds
        records.extend(
            stored
                .into_iter()
                .filter(|r| !live.contains(&r.id) && !self.table.contains(r.id)),
        );
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Whether a task produced by `definition_id` is still Queued or Running.
    pub fn has_active_for_definition(&self, definition_id: DefinitionId) -> bool {
        self.table.has_active_for_definition(definition_id)
    }

    pub async fn engine_status(&self) -> EngineStatus {
        let mut pools = Vec::with_capacity(self.pools.len());
        for pool in &self.pools {
            pools.push(PoolStatus {
                priority: pool.priority(),
                workers: pool.workers(),
                queue_capacity: pool.queue_capacity(),
                queue_depth: pool.queue_depth().await,
            });
        }
        EngineStatus {
            accepting: self.is_accepting(),
            tasks: TaskCounts::tally(&self.table.snapshots()),
            pools,
        }
    }

    /// Stop accepting work, signal every running task and wait up to
    /// `timeout` for the workers to drain.
    ///
    /// Queued tasks stay Queued in the store; no worker starts one after the
    /// running tasks have been signalled. Tasks still running when the
    /// timeout expires are reported as abandoned. Terminal records whose
    /// save failed earlier get one more attempt.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.accepting.store(false, Ordering::SeqCst);
        for pool in &self.pools {
            pool.request_shutdown();
        }
        let signalled = self.table.cancel_running();
        info!(signalled, ?timeout, "shutting down");

        let joins: Vec<_> = self.pools.iter().flat_map(|p| p.take_joins()).collect();
        let drained = tokio::time::timeout(timeout, futures::future::join_all(joins))
            .await
            .is_ok();

        let unsaved = self.executor.flush_unsaved().await;
        if unsaved > 0 {
            warn!(unsaved, "terminal records could not be persisted before shutdown");
        }

        let abandoned = self.table.running();
        let left_queued = self.table.queued();
        if !drained || !abandoned.is_empty() {
            warn!(
                abandoned = abandoned.len(),
                ?abandoned,
                "shutdown timed out with tasks still running"
            );
        }
        info!(left_queued = left_queued.len(), "shutdown complete");

        ShutdownReport {
            signalled,
            abandoned,
            left_queued,
        }
    }

    /// Reconcile the store with a fresh engine.
    ///
    /// - Running records were interrupted by the previous process: Failed.
    /// - Queued records are re-enqueued in creation order; ones whose handler
    ///   is gone or whose pool queue is full are Cancelled with a reason.
    pub(crate) async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();

        for mut record in self.store.query(&TaskFilter::with_state(TaskState::Running)).await? {
            if self.table.contains(record.id) {
                continue;
            }
            if record
                .fail(
                    "interrupted: the engine stopped while the task was running".to_string(),
                    self.clock.now(),
                )
                .is_ok()
            {
                self.store.save(&record).await?;
                warn!(task_id = %record.id, task_type = %record.task_type, "interrupted task marked failed");
                report.interrupted.push(record.id);
            }
        }

        for mut record in self.store.query(&TaskFilter::with_state(TaskState::Queued)).await? {
            if self.table.contains(record.id) {
                continue;
            }
            let task_id = record.id;
            let reason = if self.registry.contains(&record.task_type) {
                match self.pool(record.priority).queue().reserve().await {
                    Ok(slot) => {
                        self.table.insert(record);
                        slot.commit(task_id);
                        report.resumed.push(task_id);
                        continue;
                    }
                    Err(e) => format!("not resumed after restart: {e}"),
                }
            } else {
                format!(
                    "not resumed after restart: no handler registered for task_type={}",
                    record.task_type
                )
            };
            if record.abandon(reason, self.clock.now()).is_ok() {
                self.store.save(&record).await?;
                warn!(%task_id, error = ?record.error, "queued task dropped during recovery");
                report.dropped.push(task_id);
            }
        }

        if !report.resumed.is_empty() || !report.interrupted.is_empty() || !report.dropped.is_empty() {
            info!(
                resumed = report.resumed.len(),
                interrupted = report.interrupted.len(),
                dropped = report.dropped.len(),
                "recovered tasks from store"
            );
        }
        Ok(report)
    }
}
