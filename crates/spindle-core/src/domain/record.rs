//! Task record: the serializable state of one unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TransitionError;
use super::ids::{DefinitionId, TaskId};
use super::priority::Priority;
use super::state::TaskState;
use super::task::TaskType;

/// Who created the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// User or API initiated.
    Manual,
    /// Produced by the scheduler from a recurring definition.
    Scheduled,
}

/// Progress of a running task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Percent complete, 0..=100.
    pub percent: u8,
    pub message: Option<String>,
}

/// A request to create a task record.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub trigger: Trigger,
    pub definition_id: Option<DefinitionId>,
}

impl NewTask {
    pub fn manual(
        task_type: impl Into<TaskType>,
        priority: Priority,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            priority,
            payload,
            trigger: Trigger::Manual,
            definition_id: None,
        }
    }
}

/// The state of one unit of work.
///
/// State transitions go through the methods below, which enforce the state
/// machine in [`TaskState::can_transition_to`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub priority: Priority,
    pub state: TaskState,
    pub progress: Progress,
    pub payload: serde_json::Value,
    pub trigger: Trigger,

    /// Set when the task was produced by a scheduled definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_id: Option<DefinitionId>,

    /// Cancellation was signalled while running; the handler has not returned yet.
    #[serde(default)]
    pub cancel_requested: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(id: TaskId, new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_type: new.task_type,
            priority: new.priority,
            state: TaskState::Queued,
            progress: Progress::default(),
            payload: new.payload,
            trigger: new.trigger,
            definition_id: new.definition_id,
            cancel_requested: false,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, to: TaskState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Queued -> Running.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskState::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Running -> Completed.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskState::Completed)?;
        self.progress.percent = 100;
        self.finish(now);
        Ok(())
    }

    /// Running -> Failed, keeping the error text verbatim.
    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskState::Failed)?;
        self.error = Some(error);
        self.finish(now);
        Ok(())
    }

    /// Queued | Running -> Cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskState::Cancelled)?;
        self.finish(now);
        Ok(())
    }

    /// Queued -> Cancelled with a reason, for work the engine drops without
    /// ever starting it (e.g. its handler is gone after a restart).
    pub fn abandon(&mut self, reason: String, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.state != TaskState::Queued {
            return Err(TransitionError {
                from: self.state,
                to: TaskState::Cancelled,
            });
        }
        self.cancel(now)?;
        self.error = Some(reason);
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.cancel_requested = false;
        self.finished_at = Some(now);
    }

    /// Apply a progress report. Percent never moves backwards and is clamped
    /// to 100. Ignored unless Running.
    ///
    /// Returns whether anything changed.
    pub fn report_progress(&mut self, percent: u8, message: Option<String>) -> bool {
        if self.state != TaskState::Running {
            return false;
        }
        let percent = percent.min(100).max(self.progress.percent);
        let changed = percent != self.progress.percent
            || (message.is_some() && message != self.progress.message);
        self.progress.percent = percent;
        if message.is_some() {
            self.progress.message = message;
        }
        changed
    }
}
