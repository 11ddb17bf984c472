//! PoolQueue - bounded FIFO of queued task ids for one priority pool.
//!
//! Same shape as a ready list with a wake-up: `VecDeque` behind a tokio
//! mutex plus a `Notify`. Workers pop; the dispatcher reserves a slot and
//! commits it without awaiting in between.
//!
//! The bound counts tasks that will actually wait. Ids already committed but
//! not yet picked up by an idle worker are handed to that worker, so they do
//! not use up capacity: admission allows `ready < capacity + idle`.

use std::collections::VecDeque;

use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::domain::{EngineError, Priority, TaskId};

struct Lane {
    ready: VecDeque<TaskId>,
    /// Workers not currently running a task.
    idle: usize,
}

pub(crate) struct PoolQueue {
    priority: Priority,
    capacity: usize,
    workers: usize,
    lane: Mutex<Lane>,
    notify: Notify,
}

/// A reserved place at the back of the queue.
///
/// Holds the queue lock until committed or dropped; dropping it enqueues
/// nothing. Never hold one across an `.await`.
pub(crate) struct QueueSlot<'a> {
    lane: MutexGuard<'a, Lane>,
    notify: &'a Notify,
}

impl QueueSlot<'_> {
    pub(crate) fn commit(mut self, task_id: TaskId) {
        self.lane.ready.push_back(task_id);
        drop(self.lane);
        self.notify.notify_one();
    }
}

impl PoolQueue {
    pub(crate) fn new(priority: Priority, capacity: usize, workers: usize) -> Self {
        Self {
            priority,
            capacity,
            workers,
            lane: Mutex::new(Lane {
                ready: VecDeque::with_capacity(capacity.min(1024)),
                idle: workers,
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn full(&self, lane: &Lane) -> bool {
        lane.ready.len() >= self.capacity + lane.idle
    }

    fn full_error(&self) -> EngineError {
        EngineError::QueueFull {
            priority: self.priority,
            capacity: self.capacity,
        }
    }

    /// Reserve room for one task, or `QueueFull` when `capacity` tasks would
    /// already be waiting with every worker busy.
    pub(crate) async fn reserve(&self) -> Result<QueueSlot<'_>, EngineError> {
        let lane = self.lane.lock().await;
        if self.full(&lane) {
            return Err(self.full_error());
        }
        Ok(QueueSlot {
            lane,
            notify: &self.notify,
        })
    }

    /// Admission check without reserving.
    pub(crate) async fn ensure_room(&self) -> Result<(), EngineError> {
        if self.full(&*self.lane.lock().await) {
            return Err(self.full_error());
        }
        Ok(())
    }

    /// Wait for the next task id (FIFO). The calling worker counts as busy
    /// from the moment it receives an id until it calls [`PoolQueue::release`].
    ///
    /// Cancel-safe: an id is only removed in the same poll that returns it.
    pub(crate) async fn pop(&self) -> TaskId {
        loop {
            {
                let mut lane = self.lane.lock().await;
                if let Some(task_id) = lane.ready.pop_front() {
                    lane.idle = lane.idle.saturating_sub(1);
                    if !lane.ready.is_empty() {
                        // pass the wake-up on to the next idle worker
                        self.notify.notify_one();
                    }
                    return task_id;
                }
            }
            self.notify.notified().await;
        }
    }

    /// The worker that popped the last id is done with it.
    pub(crate) async fn release(&self) {
        let mut lane = self.lane.lock().await;
        lane.idle = (lane.idle + 1).min(self.workers);
    }

    /// Drop a queued id (cancelled before a worker took it).
    pub(crate) async fn remove(&self, task_id: TaskId) -> bool {
        let mut lane = self.lane.lock().await;
        let before = lane.ready.len();
        lane.ready.retain(|id| *id != task_id);
        lane.ready.len() != before
    }

    pub(crate) async fn len(&self) -> usize {
        self.lane.lock().await.ready.len()
    }
}
