//! Handlers and a harness shared by the engine tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::builder::{Engine, EngineBuilder};
use super::dispatcher::Dispatcher;
use crate::config::{EngineConfig, PoolConfig};
use crate::domain::{Priority, TaskId, TaskRecord, TaskState};
use crate::impls::InMemoryTaskStore;
use crate::ports::{Clock, StoreError, TaskFilter, TaskStore};
use crate::typed::{Handler, ProgressReporter, Task, TaskContext, TaskError, TaskHandler};

pub(crate) struct Noop;

#[async_trait]
impl TaskHandler for Noop {
    fn name(&self) -> &str {
        "noop"
    }

    async fn execute(
        &self,
        _ctx: &TaskContext,
        _task: &TaskRecord,
        _progress: &ProgressReporter,
    ) -> Result<(), TaskError> {
        Ok(())
    }
}

pub(crate) struct Failing;

#[async_trait]
impl TaskHandler for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    async fn execute(
        &self,
        _ctx: &TaskContext,
        _task: &TaskRecord,
        _progress: &ProgressReporter,
    ) -> Result<(), TaskError> {
        Err(TaskError::failed("upstream returned 503"))
    }
}

pub(crate) struct PanicHandler;

#[async_trait]
impl TaskHandler for PanicHandler {
    fn name(&self) -> &str {
        "panics"
    }

    async fn execute(
        &self,
        _ctx: &TaskContext,
        _task: &TaskRecord,
        _progress: &ProgressReporter,
    ) -> Result<(), TaskError> {
        panic!("corrupt metadata row");
    }
}

/// Sleeps through cancellation.
pub(crate) struct Stubborn;

#[async_trait]
impl TaskHandler for Stubborn {
    fn name(&self) -> &str {
        "stubborn"
    }

    async fn execute(
        &self,
        _ctx: &TaskContext,
        _task: &TaskRecord,
        _progress: &ProgressReporter,
    ) -> Result<(), TaskError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

/// Reports the given percentages in order, including backwards steps.
pub(crate) struct SteppedProgress {
    steps: Vec<u8>,
}

impl SteppedProgress {
    pub(crate) fn new(steps: Vec<u8>) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl TaskHandler for SteppedProgress {
    fn name(&self) -> &str {
        "stepped"
    }

    async fn execute(
        &self,
        _ctx: &TaskContext,
        _task: &TaskRecord,
        progress: &ProgressReporter,
    ) -> Result<(), TaskError> {
        for step in &self.steps {
            progress.report(*step, format!("step {step}")).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Ok(())
    }
}

/// Holds "gated" tasks Running until the test opens the gate. A cancelled
/// task returns `Cancelled` without a permit.
#[derive(Clone)]
pub(crate) struct Gate {
    permits: Arc<Semaphore>,
    entered: Arc<AtomicUsize>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
            entered: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Let `n` more gated tasks finish.
    pub(crate) fn open(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// How many gated tasks have started.
    pub(crate) fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

struct Gated(Gate);

#[async_trait]
impl TaskHandler for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        _task: &TaskRecord,
        _progress: &ProgressReporter,
    ) -> Result<(), TaskError> {
        self.0.entered.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = ctx.cancelled() => Err(TaskError::Cancelled),
            permit = self.0.permits.acquire() => {
                permit.map_err(TaskError::failed)?.forget();
                Ok(())
            }
        }
    }
}

/// Wraps an in-memory store. Can refuse terminal saves, or park saves of
/// Queued records until released.
pub(crate) struct FlakyStore {
    inner: Arc<InMemoryTaskStore>,
    fail_terminal: AtomicBool,
    hold_queued: AtomicBool,
    held: AtomicUsize,
    releases: Semaphore,
}

impl FlakyStore {
    pub(crate) fn new(inner: Arc<InMemoryTaskStore>) -> Self {
        Self {
            inner,
            fail_terminal: AtomicBool::new(false),
            hold_queued: AtomicBool::new(false),
            held: AtomicUsize::new(0),
            releases: Semaphore::new(0),
        }
    }

    pub(crate) fn fail_terminal(&self, fail: bool) {
        self.fail_terminal.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn hold_queued(&self, hold: bool) {
        self.hold_queued.store(hold, Ordering::SeqCst);
    }

    /// Saves currently parked.
    pub(crate) fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    pub(crate) fn release(&self, n: usize) {
        self.releases.add_permits(n);
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn save(&self, record: &TaskRecord) -> Result<(), StoreError> {
        if record.is_terminal() && self.fail_terminal.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk quota exceeded".into()));
        }
        if record.state == TaskState::Queued && self.hold_queued.load(Ordering::SeqCst) {
            self.held.fetch_add(1, Ordering::SeqCst);
            let permit = self.releases.acquire().await;
            self.held.fetch_sub(1, Ordering::SeqCst);
            permit
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .forget();
        }
        self.inner.save(record).await
    }

    async fn load(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.inner.load(id).await
    }

    async fn query(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        self.inner.query(filter).await
    }
}

/// Engine builder with test defaults: "noop" and "failing" registered, no
/// scheduler loop, an inspectable in-memory store.
pub(crate) struct Harness {
    builder: EngineBuilder,
    config: EngineConfig,
    store: Arc<InMemoryTaskStore>,
    backend: Option<Arc<dyn TaskStore>>,
    scheduler_loop: bool,
}

impl Default for Harness {
    fn default() -> Self {
        let builder = EngineBuilder::new()
            .register("noop", Arc::new(Noop))
            .and_then(|b| b.register("failing", Arc::new(Failing)))
            .expect("register default handlers");
        Self {
            builder,
            config: EngineConfig::default(),
            store: Arc::new(InMemoryTaskStore::new()),
            backend: None,
            scheduler_loop: false,
        }
    }
}

impl Harness {
    pub(crate) fn register(mut self, task_type: &str, handler: impl TaskHandler + 'static) -> Self {
        self.builder = self
            .builder
            .register(task_type, Arc::new(handler))
            .expect("register handler");
        self
    }

    pub(crate) fn typed<T: Task, H: Handler<T> + 'static>(mut self, handler: H) -> Self {
        self.builder = self
            .builder
            .register_typed::<T, H>(handler)
            .expect("register typed handler");
        self
    }

    pub(crate) fn gated(self, gate: &Gate) -> Self {
        self.register("gated", Gated(gate.clone()))
    }

    pub(crate) fn pool(mut self, priority: Priority, pool: PoolConfig) -> Self {
        self.config.pools.set(priority, pool);
        self
    }

    pub(crate) fn tick(mut self, tick: Duration) -> Self {
        self.config.scheduler_tick_ms = tick.as_millis() as u64;
        self
    }

    pub(crate) fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.builder = self.builder.clock(clock);
        self
    }

    pub(crate) fn store(mut self, store: Arc<InMemoryTaskStore>) -> Self {
        self.store = store;
        self
    }

    /// Store the engine talks to instead of `store`; `TestEngine::store`
    /// still exposes the in-memory store, which `backend` should wrap.
    pub(crate) fn backend(mut self, backend: Arc<dyn TaskStore>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub(crate) fn with_scheduler_loop(mut self) -> Self {
        self.scheduler_loop = true;
        self
    }

    pub(crate) async fn start(self) -> TestEngine {
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::clone(&self.store) as Arc<dyn TaskStore>);
        let mut builder = self.builder.config(self.config).store(backend);
        if !self.scheduler_loop {
            builder = builder.without_scheduler_loop();
        }
        TestEngine {
            engine: builder.build().await.expect("build engine"),
            store: self.store,
        }
    }
}

pub(crate) struct TestEngine {
    pub(crate) engine: Engine,
    pub(crate) store: Arc<InMemoryTaskStore>,
}

impl TestEngine {
    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        self.engine.dispatcher()
    }
}

/// Poll `status` until the task reaches `state`. Panics on timeout or when
/// the task settles in a different terminal state.
pub(crate) async fn wait_for_state(
    dispatcher: &Dispatcher,
    task_id: TaskId,
    state: TaskState,
) -> TaskRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = dispatcher.status(task_id).await.expect("status");
        if record.state == state {
            return record;
        }
        assert!(
            !record.is_terminal(),
            "task {task_id} ended {} while waiting for {state}",
            record.state
        );
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} still {} after 5s, waiting for {state}",
            record.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
