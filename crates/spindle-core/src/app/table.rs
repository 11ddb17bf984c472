//! TaskTable - the live (non-retired) task records.
//!
//! Every state transition on a live record happens here under one short
//! lock, which is what makes the Queued -> Running hand-off single-owner and
//! the cancel/dequeue race well defined. The lock is never held across an
//! `.await`; readers get cloned snapshots.
//!
//! A record retires only once its terminal state is saved. Until then it
//! stays here, terminal, and keeps answering status and cancel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::worker_loop::ExecutionOutcome;
use crate::domain::{DefinitionId, TaskId, TaskRecord, TaskState};

struct LiveTask {
    record: TaskRecord,
    token: CancellationToken,
    last_persisted: Option<Instant>,
}

/// What a cancellation request did.
#[derive(Debug)]
pub(crate) enum CancelOutcome {
    /// Was queued; now Cancelled. Caller removes it from the pool queue.
    Dequeued(TaskRecord),
    /// Was running; its token has been signalled.
    Signalled,
    Terminal(TaskState),
    Missing,
}

#[derive(Default)]
pub struct TaskTable {
    tasks: Mutex<HashMap<TaskId, LiveTask>>,
    /// Set by `cancel_running`; read and written under the `tasks` lock.
    draining: AtomicBool,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, LiveTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, record: TaskRecord) {
        self.lock().insert(
            record.id,
            LiveTask {
                record,
                token: CancellationToken::new(),
                last_persisted: None,
            },
        );
    }

    pub(crate) fn remove(&self, id: TaskId) {
        self.lock().remove(&id);
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn snapshot(&self, id: TaskId) -> Option<TaskRecord> {
        self.lock().get(&id).map(|t| t.record.clone())
    }

    pub fn snapshots(&self) -> Vec<TaskRecord> {
        self.lock().values().map(|t| t.record.clone()).collect()
    }

    pub fn has_active_for_definition(&self, definition_id: DefinitionId) -> bool {
        self.lock().values().any(|t| {
            t.record.definition_id == Some(definition_id) && !t.record.is_terminal()
        })
    }

    pub fn running(&self) -> Vec<TaskId> {
        self.ids_in(TaskState::Running)
    }

    pub fn queued(&self) -> Vec<TaskId> {
        self.ids_in(TaskState::Queued)
    }

    /// Terminal records whose final save has not gone through yet.
    pub fn unsaved(&self) -> Vec<TaskRecord> {
        self.lock()
            .values()
            .filter(|t| t.record.is_terminal())
            .map(|t| t.record.clone())
            .collect()
    }

    fn ids_in(&self, state: TaskState) -> Vec<TaskId> {
        self.lock()
            .values()
            .filter(|t| t.record.state == state)
            .map(|t| t.record.id)
            .collect()
    }

    /// Queued -> Running. `None` if the record is gone, no longer queued
    /// (cancelled between enqueue and dequeue) or the engine is shutting
    /// down, in which case it stays Queued.
    pub(crate) fn begin(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Option<(TaskRecord, CancellationToken)> {
        let mut tasks = self.lock();
        if self.draining.load(Ordering::SeqCst) {
            return None;
        }
        let live = tasks.get_mut(&id)?;
        live.record.start(now).ok()?;
        live.last_persisted = Some(Instant::now());
        Some((live.record.clone(), live.token.clone()))
    }

    /// Apply a progress report. Returns a snapshot when it should be
    /// persisted (changed, and the throttle interval has passed).
    pub(crate) fn progress(
        &self,
        id: TaskId,
        percent: u8,
        message: Option<String>,
        persist_every: Duration,
    ) -> Option<TaskRecord> {
        let mut tasks = self.lock();
        let live = tasks.get_mut(&id)?;
        if !live.record.report_progress(percent, message) {
            return None;
        }
        let due = live
            .last_persisted
            .is_none_or(|at| at.elapsed() >= persist_every);
        if !due {
            return None;
        }
        live.last_persisted = Some(Instant::now());
        Some(live.record.clone())
    }

    /// Running -> terminal.
    pub(crate) fn finish(
        &self,
        id: TaskId,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> Option<TaskRecord> {
        let mut tasks = self.lock();
        let live = tasks.get_mut(&id)?;
        let result = match outcome {
            ExecutionOutcome::Completed => live.record.complete(now),
            ExecutionOutcome::Failed(error) => live.record.fail(error.clone(), now),
            ExecutionOutcome::Cancelled => live.record.cancel(now),
        };
        result.ok()?;
        Some(live.record.clone())
    }

    pub(crate) fn request_cancel(&self, id: TaskId, now: DateTime<Utc>) -> CancelOutcome {
        let mut tasks = self.lock();
        let Some(live) = tasks.get_mut(&id) else {
            return CancelOutcome::Missing;
        };
        match live.record.state {
            TaskState::Queued => match live.record.cancel(now) {
                Ok(()) => CancelOutcome::Dequeued(live.record.clone()),
                Err(_) => CancelOutcome::Terminal(live.record.state),
            },
            TaskState::Running => {
                live.record.cancel_requested = true;
                live.token.cancel();
                CancelOutcome::Signalled
            }
            state => CancelOutcome::Terminal(state),
        }
    }

    /// Signal every running task and refuse to start any more. Returns how
    /// many were signalled.
    pub(crate) fn cancel_running(&self) -> usize {
        let mut tasks = self.lock();
        self.draining.store(true, Ordering::SeqCst);
        let mut n = 0;
        for live in tasks.values_mut() {
            if live.record.state == TaskState::Running {
                live.record.cancel_requested = true;
                live.token.cancel();
                n += 1;
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, Priority};
    use ulid::Ulid;

    fn queued(table: &TaskTable) -> TaskId {
        let r = TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::manual("refresh", Priority::Normal, serde_json::json!({})),
            Utc::now(),
        );
        let id = r.id;
        table.insert(r);
        id
    }

    #[test]
    fn begin_is_single_owner() {
        let table = TaskTable::new();
        let id = queued(&table);

        assert!(table.begin(id, Utc::now()).is_some());
        assert!(table.begin(id, Utc::now()).is_none());
        assert_eq!(table.running(), vec![id]);
    }

    #[test]
    fn cancel_before_dequeue_wins() {
        let table = TaskTable::new();
        let id = queued(&table);

        let outcome = table.request_cancel(id, Utc::now());
        assert!(matches!(outcome, CancelOutcome::Dequeued(r) if r.state == TaskState::Cancelled));
        assert!(table.begin(id, Utc::now()).is_none());
    }

    #[test]
    fn cancel_running_signals_token() {
        let table = TaskTable::new();
        let id = queued(&table);
        let (_, token) = table.begin(id, Utc::now()).unwrap();

        assert!(matches!(table.request_cancel(id, Utc::now()), CancelOutcome::Signalled));
        assert!(token.is_cancelled());
        assert!(table.snapshot(id).unwrap().cancel_requested);
        assert_eq!(table.snapshot(id).unwrap().state, TaskState::Running);
    }

    #[test]
    fn cancel_after_finish_reports_terminal() {
        let table = TaskTable::new();
        let id = queued(&table);
        table.begin(id, Utc::now()).unwrap();
        table.finish(id, &ExecutionOutcome::Completed, Utc::now()).unwrap();

        for _ in 0..2 {
            assert!(matches!(
                table.request_cancel(id, Utc::now()),
                CancelOutcome::Terminal(TaskState::Completed)
            ));
        }
    }

    #[test]
    fn progress_persistence_is_throttled() {
        let table = TaskTable::new();
        let id = queued(&table);
        table.begin(id, Utc::now()).unwrap();

        let every = Duration::from_secs(3600);
        assert!(table.progress(id, 10, None, every).is_none());
        assert_eq!(table.snapshot(id).unwrap().progress.percent, 10);

        assert!(table.progress(id, 20, None, Duration::ZERO).is_some());
        assert!(table.progress(id, 20, None, Duration::ZERO).is_none());
    }

    #[test]
    fn nothing_starts_once_running_tasks_are_signalled() {
        let table = TaskTable::new();
        let running = queued(&table);
        let (_, token) = table.begin(running, Utc::now()).unwrap();
        let waiting = queued(&table);

        assert_eq!(table.cancel_running(), 1);
        assert!(token.is_cancelled());
        assert!(table.begin(waiting, Utc::now()).is_none());
        assert_eq!(table.queued(), vec![waiting]);
    }

    #[test]
    fn finished_records_are_unsaved_until_removed() {
        let table = TaskTable::new();
        let id = queued(&table);
        let other = queued(&table);
        table.begin(id, Utc::now()).unwrap();
        assert!(table.unsaved().is_empty());

        table
            .finish(id, &ExecutionOutcome::Failed("disk full".into()), Utc::now())
            .unwrap();
        let unsaved = table.unsaved();
        assert_eq!(unsaved.len(), 1);
        assert_eq!(unsaved[0].state, TaskState::Failed);

        table.remove(id);
        assert!(table.unsaved().is_empty());
        assert!(table.contains(other));
    }
}
