//! Handler contract and registry.
//!
//! - **TaskHandler**: object-safe contract invoked by workers
//! - **TaskContext / ProgressReporter**: cancellation signal and progress
//!   callback passed into every invocation
//! - **HandlerRegistry**: task type name -> handler
//! - **Task / Handler<T>**: typed surface over JSON payloads

pub mod codec;
pub mod context;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::codec::{CodecError, PayloadCodec};
pub use self::context::{ProgressReporter, ProgressSink, TaskContext, TaskError};
pub use self::handler::{Handler, TaskHandler, TypedHandler};
pub use self::registry::{HandlerRegistry, RegistryError};
pub use self::task::Task;
