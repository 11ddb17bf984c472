//! Handler contracts.
//!
//! Two layers:
//! - **TaskHandler**: the object-safe contract the workers invoke. Stored as
//!   `Arc<dyn TaskHandler>` in the registry.
//! - **Handler<T>**: the typed surface. `TypedHandler<T, H>` erases it into a
//!   `TaskHandler` by decoding the record's payload into `T`.

use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec::PayloadCodec;
use super::context::{ProgressReporter, TaskContext, TaskError};
use super::task::Task;
use crate::domain::TaskRecord;

/// Executes one task type.
///
/// Handlers must observe `ctx` between expensive steps and return
/// `Err(TaskError::Cancelled)` when cancelled. The engine never retries a
/// failed execution, so handlers should be safe to re-submit.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        progress: &ProgressReporter,
    ) -> Result<(), TaskError>;
}

/// Typed handler for payload type `T`.
///
/// ```ignore
/// struct RefreshMovieHandler;
///
/// #[async_trait]
/// impl Handler<RefreshMovie> for RefreshMovieHandler {
///     async fn handle(
///         &self,
///         ctx: &TaskContext,
///         task: RefreshMovie,
///         progress: &ProgressReporter,
///     ) -> Result<(), TaskError> {
///         for id in task.movie_ids {
///             ctx.checkpoint()?;
///             // ...
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    fn description(&self) -> &str {
        ""
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        task: T,
        progress: &ProgressReporter,
    ) -> Result<(), TaskError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    fn name(&self) -> &str {
        T::TYPE
    }

    fn description(&self) -> &str {
        self.handler.description()
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        progress: &ProgressReporter,
    ) -> Result<(), TaskError> {
        let typed: T = PayloadCodec::decode(&task.payload)?;
        self.handler.handle(ctx, typed, progress).await
    }
}
