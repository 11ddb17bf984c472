//! spindle-core
//!
//! In-process background task engine: typed handlers, priority-isolated
//! worker pools with bounded queues, cooperative cancellation, progress
//! reporting and a recurring-task scheduler.
//!
//! # Modules
//! - **domain**: records, ids, priorities, states, scheduled definitions, errors
//! - **ports**: TaskStore, Clock, IdGenerator
//! - **typed**: TaskHandler / Handler<T>, TaskContext, ProgressReporter, HandlerRegistry
//! - **app**: EngineBuilder, Dispatcher, WorkerPool, Scheduler
//! - **impls**: InMemoryTaskStore
//! - **config**: EngineConfig

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use crate::app::{Dispatcher, Engine, EngineBuilder, Scheduler};
pub use crate::config::{EngineConfig, PoolConfig};
pub use crate::domain::{EngineError, NewTask, Priority, TaskId, TaskRecord, TaskState};
pub use crate::typed::{Handler, ProgressReporter, Task, TaskContext, TaskError, TaskHandler};
