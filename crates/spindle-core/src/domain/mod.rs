//! Domain model: ids, task records, state machine, schedules, errors.

pub mod errors;
pub mod ids;
pub mod priority;
pub mod record;
pub mod schedule;
pub mod state;
pub mod task;

pub use errors::{EngineError, TransitionError};
pub use ids::{DefinitionId, TaskId};
pub use priority::Priority;
pub use record::{NewTask, Progress, TaskRecord, Trigger};
pub use schedule::ScheduledDefinition;
pub use state::TaskState;
pub use task::TaskType;
