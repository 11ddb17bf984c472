//! TaskStore port: persistence of task records.
//!
//! The engine calls `save` on every state transition (and, throttled, on
//! progress). It does not assume the store is transactional across fields,
//! only that the latest `save` for an id wins.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{DefinitionId, Priority, TaskId, TaskRecord, TaskState, TaskType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
}

/// Query filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub task_type: Option<TaskType>,
    pub priority: Option<Priority>,
    pub definition_id: Option<DefinitionId>,
}

impl TaskFilter {
    pub fn with_state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        self.state.is_none_or(|s| record.state == s)
            && self
                .task_type
                .as_ref()
                .is_none_or(|t| &record.task_type == t)
            && self.priority.is_none_or(|p| record.priority == p)
            && self
                .definition_id
                .is_none_or(|d| record.definition_id == Some(d))
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, record: &TaskRecord) -> Result<(), StoreError>;

    async fn load(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Records matching `filter`, oldest first.
    async fn query(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError>;
}
