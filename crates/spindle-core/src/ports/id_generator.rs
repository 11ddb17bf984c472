//! IdGenerator port.
//!
//! IDs are ULIDs whose timestamp part comes from the injected [`Clock`], so
//! tests with a `FixedClock` get IDs stamped with the pinned time.

use ulid::Ulid;

use crate::domain::{DefinitionId, TaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_definition_id(&self) -> DefinitionId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn generate_definition_id(&self) -> DefinitionId {
        DefinitionId::from(self.next())
    }
}
