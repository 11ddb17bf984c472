//! InMemoryTaskStore - a `TaskStore` backed by a `HashMap`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{TaskId, TaskRecord};
use crate::ports::{StoreError, TaskFilter, TaskStore};

#[derive(Default)]
pub struct InMemoryTaskStore {
    records: Mutex<HashMap<TaskId, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with records, e.g. left behind by a previous process.
    pub fn with_records(records: impl IntoIterator<Item = TaskRecord>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().map(|r| (r.id, r)).collect()),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.records.lock().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn load(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn query(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let mut out: Vec<TaskRecord> = self
            .records
            .lock()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.created_at, r.id));
        Ok(out)
    }
}
