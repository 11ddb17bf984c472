//! Task state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a task record.
///
/// State transitions:
/// - Queued -> Running -> Completed | Failed | Cancelled
/// - Queued -> Cancelled (cancelled before any worker dequeued it)
///
/// Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in its pool's queue.
    Queued,

    /// Owned by exactly one worker.
    Running,

    /// Handler returned success.
    Completed,

    /// Handler returned an error or terminated abnormally.
    Failed,

    /// Cancelled while queued, or the handler honored a cancellation signal.
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Queued,
        TaskState::Running,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Cancelled) | (Running, Completed | Failed | Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
