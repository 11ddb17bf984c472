//! Status - engine-wide counts and reports.

use serde::{Deserialize, Serialize};

use crate::domain::{Priority, TaskId, TaskRecord, TaskState};

/// Live task counts by state.
///
/// Terminal counts are only the records that have not retired from the live
/// table yet; history lives in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            match record.state {
                TaskState::Queued => counts.queued += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn get(&self, state: TaskState) -> usize {
        match state {
            TaskState::Queued => self.queued,
            TaskState::Running => self.running,
            TaskState::Completed => self.completed,
            TaskState::Failed => self.failed,
            TaskState::Cancelled => self.cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub priority: Priority,
    pub workers: usize,
    pub queue_capacity: usize,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub accepting: bool,
    pub tasks: TaskCounts,
    pub pools: Vec<PoolStatus>,
}

impl EngineStatus {
    pub fn pool(&self, priority: Priority) -> Option<&PoolStatus> {
        self.pools.iter().find(|p| p.priority == priority)
    }
}

/// Result of `Dispatcher::shutdown`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Running tasks whose cancellation token was signalled.
    pub signalled: usize,

    /// Still Running when the timeout expired; left detached.
    pub abandoned: Vec<TaskId>,

    /// Still Queued; picked up again by recovery on the next start.
    pub left_queued: Vec<TaskId>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

/// Result of start-up recovery from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Queued records put back on their pool queue.
    pub resumed: Vec<TaskId>,

    /// Records that were Running when the previous process stopped; now Failed.
    pub interrupted: Vec<TaskId>,

    /// Queued records that could not be resumed; now Cancelled with a reason.
    pub dropped: Vec<TaskId>,
}
