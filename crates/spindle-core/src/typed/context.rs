//! Execution context handed to handlers: cancellation and progress.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::codec::CodecError;
use crate::domain::TaskId;

/// Result of a handler invocation, other than success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The handler observed the cancellation signal and stopped.
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    #[error("payload decode: {0}")]
    Payload(String),
}

impl TaskError {
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

impl From<CodecError> for TaskError {
    fn from(e: CodecError) -> Self {
        Self::Payload(e.to_string())
    }
}

/// Cooperative cancellation handle for one running task.
///
/// The engine only signals; handlers are expected to check between
/// expensive steps and return `Err(TaskError::Cancelled)`.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    token: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: TaskId, token: CancellationToken) -> Self {
        Self { task_id, token }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(TaskError::Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.token.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested; use inside `tokio::select!`.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Receiver of progress reports for a task.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, task_id: TaskId, percent: u8, message: Option<String>);
}

/// Progress callback passed to handlers.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl ProgressReporter {
    pub fn new(task_id: TaskId, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            task_id,
            sink: Some(sink),
        }
    }

    /// A reporter that drops every report (handler unit tests).
    pub fn detached(task_id: TaskId) -> Self {
        Self {
            task_id,
            sink: None,
        }
    }

    /// Report percent complete with a status message.
    ///
    /// Percent values lower than an earlier report are ignored.
    pub async fn report(&self, percent: u8, message: impl Into<String>) {
        if let Some(sink) = &self.sink {
            sink.report(self.task_id, percent, Some(message.into())).await;
        }
    }

    pub async fn percent(&self, percent: u8) {
        if let Some(sink) = &self.sink {
            sink.report(self.task_id, percent, None).await;
        }
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("task_id", &self.task_id)
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;
    use ulid::Ulid;

    #[derive(Default)]
    struct Capture(Mutex<Vec<(u8, Option<String>)>>);

    #[async_trait]
    impl ProgressSink for Capture {
        async fn report(&self, _task_id: TaskId, percent: u8, message: Option<String>) {
            self.0.lock().await.push((percent, message));
        }
    }

    #[test]
    fn checkpoint_fails_after_cancel() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new(TaskId::from_ulid(Ulid::new()), token.clone());
        assert!(ctx.checkpoint().is_ok());

        token.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.checkpoint(), Err(TaskError::Cancelled));
    }

    #[tokio::test]
    async fn reporter_forwards_to_sink() {
        let sink = Arc::new(Capture::default());
        let reporter = ProgressReporter::new(TaskId::from_ulid(Ulid::new()), sink.clone());

        reporter.report(10, "fetching").await;
        reporter.percent(60).await;

        let seen = sink.0.lock().await.clone();
        assert_eq!(seen, vec![(10, Some("fetching".to_string())), (60, None)]);
    }

    #[tokio::test]
    async fn detached_reporter_is_silent() {
        let reporter = ProgressReporter::detached(TaskId::from_ulid(Ulid::new()));
        reporter.report(50, "ignored").await;
    }
}
