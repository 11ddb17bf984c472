//! App - the running engine.
//!
//! # Components
//! - **EngineBuilder / Engine**: wiring, start-up validation, shutdown
//! - **Dispatcher**: submit, cancel, status, listing, recovery
//! - **WorkerPool**: bounded queue plus fixed workers, one per priority
//! - **WorkerLoop**: pop -> begin -> handle -> finish -> persist
//! - **Scheduler**: recurring definitions -> scheduled submissions
//! - **Status**: counts and reports

pub mod builder;
pub mod dispatcher;
pub mod pool;
mod queue;
pub mod scheduler;
pub mod status;
pub mod table;
mod worker_loop;

#[cfg(test)]
pub(crate) mod test_support;

pub use self::builder::{BuildError, Engine, EngineBuilder};
pub use self::dispatcher::Dispatcher;
pub use self::pool::WorkerPool;
pub use self::scheduler::{Scheduler, TickReport};
pub use self::status::{EngineStatus, PoolStatus, RecoveryReport, ShutdownReport, TaskCounts};
pub use self::table::TaskTable;
