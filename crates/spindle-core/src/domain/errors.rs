//! Caller-facing errors.

use thiserror::Error;

use super::ids::{DefinitionId, TaskId};
use super::priority::Priority;
use super::state::TaskState;
use super::task::TaskType;
use crate::ports::StoreError;

/// Errors returned synchronously by the dispatcher and scheduler.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{priority} queue is full (capacity {capacity})")]
    QueueFull { priority: Priority, capacity: usize },

    #[error("no handler registered for task_type={0}")]
    UnknownHandler(TaskType),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {id} is already {state}")]
    AlreadyTerminal { id: TaskId, state: TaskState },

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("scheduled definition {0} not found")]
    DefinitionNotFound(DefinitionId),

    #[error("payload for {task_type} could not be encoded: {message}")]
    InvalidPayload { task_type: TaskType, message: String },

    #[error("task store: {0}")]
    Store(#[from] StoreError),
}

/// An illegal state-machine transition was attempted on a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskState,
    pub to: TaskState,
}
