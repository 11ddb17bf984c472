//! Scheduled task definitions (recurring-task configuration).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DefinitionId, TaskId};
use super::priority::Priority;
use super::record::{NewTask, Trigger};
use super::task::TaskType;

/// A recurring task owned by the scheduler.
///
/// Each firing produces a new task record with `Trigger::Scheduled`; a
/// definition never reuses a finished record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledDefinition {
    pub id: DefinitionId,
    pub task_type: TaskType,
    pub priority: Priority,
    pub payload: serde_json::Value,

    #[serde(with = "interval_ms")]
    pub interval: Duration,
    pub enabled: bool,

    /// `None` means never run; due on the next tick.
    pub last_run: Option<DateTime<Utc>>,

    /// Most recent task produced by this definition (overlap check).
    pub last_task: Option<TaskId>,
}

impl ScheduledDefinition {
    pub fn new(
        id: DefinitionId,
        task_type: impl Into<TaskType>,
        priority: Priority,
        interval: Duration,
    ) -> Self {
        Self {
            id,
            task_type: task_type.into(),
            priority,
            payload: serde_json::Value::Null,
            interval,
            enabled: true,
            last_run: None,
            last_task: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_last_run(mut self, last_run: DateTime<Utc>) -> Self {
        self.last_run = Some(last_run);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// When the definition next becomes due (`None` = due now).
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        let last = self.last_run?;
        let interval = chrono::Duration::from_std(self.interval).unwrap_or(chrono::Duration::MAX);
        Some(last.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    /// `enabled && now - last_run >= interval`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.next_due_at() {
            None => true,
            Some(due) => now >= due,
        }
    }

    pub fn to_new_task(&self) -> NewTask {
        NewTask {
            task_type: self.task_type.clone(),
            priority: self.priority,
            payload: self.payload.clone(),
            trigger: Trigger::Scheduled,
            definition_id: Some(self.id),
        }
    }
}

mod interval_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
