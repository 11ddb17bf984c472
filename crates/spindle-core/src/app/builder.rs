//! EngineBuilder - construction and wiring of the engine.
//!
//! - handlers are registered here and the registry is frozen by `build()`
//! - start-up validation is fail-fast: expected task types and scheduled
//!   definitions must have handlers before anything runs
//! - `build()` spawns the pools, recovers stored work and starts the
//!   scheduler loop

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::dispatcher::Dispatcher;
use super::scheduler::Scheduler;
use super::status::{RecoveryReport, ShutdownReport};
use crate::config::EngineConfig;
use crate::domain::{EngineError, Priority, ScheduledDefinition, TaskType};
use crate::impls::InMemoryTaskStore;
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::typed::{Handler, HandlerRegistry, RegistryError, Task, TaskHandler};

/// Builds an [`Engine`].
///
/// ```ignore
/// let engine = EngineBuilder::new()
///     .config(config)
///     .register_typed::<RefreshMovie, _>(RefreshMovieHandler)?
///     .schedule("housekeeping", Priority::Background, Duration::from_secs(3600))
///     .expect_tasks(&["movies.refresh.v1", "housekeeping"])
///     .build()
///     .await?;
/// ```
pub struct EngineBuilder {
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<String>>,
    config: EngineConfig,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    schedules: Vec<(TaskType, Priority, Duration, serde_json::Value)>,
    scheduler_loop: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("scheduled definition for task_type={0} has no registered handler")]
    UnknownScheduledTask(TaskType),

    #[error("engine start failed: {0}")]
    Start(#[from] EngineError),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            expected_tasks: None,
            config: EngineConfig::default(),
            store: None,
            clock: None,
            schedules: Vec::new(),
            scheduler_loop: true,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to an [`InMemoryTaskStore`].
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn register(
        mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(task_type, handler)?;
        Ok(self)
    }

    pub fn register_typed<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    /// Task types that must be registered for `build()` to succeed.
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// A recurring definition to add when the engine starts.
    pub fn schedule(
        self,
        task_type: impl Into<TaskType>,
        priority: Priority,
        interval: Duration,
    ) -> Self {
        self.schedule_with_payload(task_type, priority, interval, serde_json::Value::Null)
    }

    pub fn schedule_with_payload(
        mut self,
        task_type: impl Into<TaskType>,
        priority: Priority,
        interval: Duration,
        payload: serde_json::Value,
    ) -> Self {
        self.schedules
            .push((task_type.into(), priority, interval, payload));
        self
    }

    /// Do not spawn the periodic scheduler loop; `Scheduler::tick` is then
    /// driven by the caller.
    pub fn without_scheduler_loop(mut self) -> Self {
        self.scheduler_loop = false;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|t| !self.registry.contains(&TaskType::new(t.as_str())))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }
        if let Some((task_type, ..)) = self
            .schedules
            .iter()
            .find(|(t, ..)| !self.registry.contains(t))
        {
            return Err(BuildError::UnknownScheduledTask(task_type.clone()));
        }
        Ok(())
    }

    /// Validate, start the pools, recover stored work and start scheduling.
    pub async fn build(self) -> Result<Engine, BuildError> {
        self.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let registry = Arc::new(self.registry);

        let dispatcher = Arc::new(Dispatcher::start(
            Arc::clone(&registry),
            &self.config,
            store,
            Arc::clone(&clock),
            Arc::clone(&ids),
        ));

        let recovery = match dispatcher.recover().await {
            Ok(report) => report,
            Err(e) => {
                dispatcher.shutdown(Duration::ZERO).await;
                return Err(e.into());
            }
        };

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&dispatcher),
            clock,
            Arc::clone(&ids),
            self.config.scheduler_tick(),
        ));
        for (task_type, priority, interval, payload) in self.schedules {
            let definition = ScheduledDefinition::new(ids.generate_definition_id(), task_type, priority, interval)
                .with_payload(payload);
            scheduler.add_definition(definition).await?;
        }

        let scheduler_shutdown = CancellationToken::new();
        let scheduler_join = self
            .scheduler_loop
            .then(|| Arc::clone(&scheduler).spawn(scheduler_shutdown.clone()));

        info!(
            task_types = ?registry.registered_types().iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            resumed = recovery.resumed.len(),
            "engine started"
        );

        Ok(Engine {
            config: self.config,
            dispatcher,
            scheduler,
            scheduler_shutdown,
            scheduler_join: Mutex::new(scheduler_join),
            recovery,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running engine: dispatcher, worker pools and scheduler.
pub struct Engine {
    config: EngineConfig,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    scheduler_shutdown: CancellationToken,
    scheduler_join: Mutex<Option<JoinHandle<()>>>,
    recovery: RecoveryReport,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What start-up recovery did with the records already in the store.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Stop the scheduler, then shut the dispatcher down.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.scheduler_shutdown.cancel();
        let join = self
            .scheduler_join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join
            && let Err(e) = join.await
        {
            warn!(error = %e, "scheduler loop ended abnormally");
        }
        self.dispatcher.shutdown(timeout).await
    }

    /// `shutdown` with the configured timeout.
    pub async fn shutdown_default(&self) -> ShutdownReport {
        self.shutdown(self.config.shutdown_timeout()).await
    }
}
