//! Scheduler - turns recurring definitions into submitted tasks.
//!
//! On every tick each enabled definition whose interval has elapsed is
//! submitted through the dispatcher, unless a task it produced earlier is
//! still Queued or Running (no overlap). `last_run` only advances when a
//! submission is accepted, so a rejected firing is retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;
use crate::domain::{DefinitionId, EngineError, Priority, ScheduledDefinition, TaskId, TaskType};
use crate::ports::{Clock, IdGenerator};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub submitted: Vec<(DefinitionId, TaskId)>,
    /// Due, but the previous task of the definition is still active.
    pub skipped: Vec<DefinitionId>,
    /// Due, but the dispatcher rejected the submission.
    pub rejected: Vec<(DefinitionId, String)>,
}

enum Firing {
    Submitted(TaskId),
    Overlapping,
    Rejected(EngineError),
}

pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    tick: Duration,
    definitions: Mutex<Vec<ScheduledDefinition>>,
}

impl Scheduler {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        tick: Duration,
    ) -> Self {
        Self {
            dispatcher,
            clock,
            ids,
            tick,
            definitions: Mutex::new(Vec::new()),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick
    }

    /// A fresh enabled definition with a generated id. Not registered until
    /// passed to [`Scheduler::add_definition`].
    pub fn define(
        &self,
        task_type: impl Into<TaskType>,
        priority: Priority,
        interval: Duration,
    ) -> ScheduledDefinition {
        ScheduledDefinition::new(self.ids.generate_definition_id(), task_type, priority, interval)
    }

    /// Register a definition. A definition with the same id is replaced.
    ///
    /// The task type must have a handler, otherwise every firing would be
    /// rejected.
    pub async fn add_definition(
        &self,
        definition: ScheduledDefinition,
    ) -> Result<DefinitionId, EngineError> {
        if !self.dispatcher.registered_types().contains(&definition.task_type) {
            return Err(EngineError::UnknownHandler(definition.task_type));
        }
        let id = definition.id;
        let mut definitions = self.definitions.lock().await;
        info!(
            definition_id = %id,
            task_type = %definition.task_type,
            interval = ?definition.interval,
            enabled = definition.enabled,
            "scheduled definition added"
        );
        match definitions.iter_mut().find(|d| d.id == id) {
            Some(existing) => *existing = definition,
            None => definitions.push(definition),
        }
        Ok(id)
    }

    pub async fn remove_definition(&self, id: DefinitionId) -> Result<ScheduledDefinition, EngineError> {
        let mut definitions = self.definitions.lock().await;
        let pos = definitions
            .iter()
            .position(|d| d.id == id)
            .ok_or(EngineError::DefinitionNotFound(id))?;
        Ok(definitions.remove(pos))
    }

    /// Enable or disable. Takes effect from the next tick.
    pub async fn set_enabled(&self, id: DefinitionId, enabled: bool) -> Result<(), EngineError> {
        self.update(id, |d| d.enabled = enabled).await
    }

    /// Change the interval. Takes effect from the next tick, measured from
    /// the existing `last_run`.
    pub async fn set_interval(&self, id: DefinitionId, interval: Duration) -> Result<(), EngineError> {
        self.update(id, |d| d.interval = interval).await
    }

    async fn update(
        &self,
        id: DefinitionId,
        f: impl FnOnce(&mut ScheduledDefinition),
    ) -> Result<(), EngineError> {
        let mut definitions = self.definitions.lock().await;
        let definition = definitions
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(EngineError::DefinitionNotFound(id))?;
        f(definition);
        debug!(definition_id = %id, enabled = definition.enabled, interval = ?definition.interval, "definition updated");
        Ok(())
    }

    pub async fn definition(&self, id: DefinitionId) -> Result<ScheduledDefinition, EngineError> {
        self.definitions
            .lock()
            .await
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or(EngineError::DefinitionNotFound(id))
    }

    pub async fn definitions(&self) -> Vec<ScheduledDefinition> {
        self.definitions.lock().await.clone()
    }

    /// Fire a definition now, regardless of its interval or enabled flag.
    ///
    /// `Ok(None)` when its previous task is still active.
    pub async fn run_now(&self, id: DefinitionId) -> Result<Option<TaskId>, EngineError> {
        let now = self.clock.now();
        let mut definitions = self.definitions.lock().await;
        let definition = definitions
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(EngineError::DefinitionNotFound(id))?;
        match self.fire(definition, now).await {
            Firing::Submitted(task_id) => Ok(Some(task_id)),
            Firing::Overlapping => Ok(None),
            Firing::Rejected(e) => Err(e),
        }
    }

    /// Evaluate every definition once.
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();
        let mut definitions = self.definitions.lock().await;
        for definition in definitions.iter_mut().filter(|d| d.is_due(now)) {
            let id = definition.id;
            match self.fire(definition, now).await {
                Firing::Submitted(task_id) => report.submitted.push((id, task_id)),
                Firing::Overlapping => report.skipped.push(id),
                Firing::Rejected(e) => report.rejected.push((id, e.to_string())),
            }
        }
        report
    }

    async fn fire(&self, definition: &mut ScheduledDefinition, now: chrono::DateTime<chrono::Utc>) -> Firing {
        if self.dispatcher.has_active_for_definition(definition.id) {
            debug!(
                definition_id = %definition.id,
                last_task = ?definition.last_task.map(|t| t.to_string()),
                "previous run still active; skipping"
            );
            return Firing::Overlapping;
        }
        match self.dispatcher.submit(definition.to_new_task()).await {
            Ok(task_id) => {
                definition.last_run = Some(now);
                definition.last_task = Some(task_id);
                info!(definition_id = %definition.id, %task_id, task_type = %definition.task_type, "scheduled task submitted");
                Firing::Submitted(task_id)
            }
            Err(e) => {
                warn!(definition_id = %definition.id, task_type = %definition.task_type, error = %e, "scheduled submission rejected");
                Firing::Rejected(e)
            }
        }
    }

    /// Run `tick()` every `tick_interval()` until `shutdown` fires.
    pub(crate) fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(tick = ?self.tick, "scheduler started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let report = self.tick().await;
                        if !report.submitted.is_empty() || !report.rejected.is_empty() {
                            debug!(
                                submitted = report.submitted.len(),
                                skipped = report.skipped.len(),
                                rejected = report.rejected.len(),
                                "scheduler tick"
                            );
                        }
                    }
                }
            }
            debug!("scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{Gate, Harness, wait_for_state};
    use super::*;
    use crate::config::PoolConfig;
    use crate::domain::{TaskState, Trigger};
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap()))
    }

    #[tokio::test]
    async fn due_definition_submits_a_scheduled_task() {
        let clock = clock();
        let h = Harness::default().clock(clock.clone()).start().await;
        let s = h.engine.scheduler();
        let def = s.define("noop", Priority::Background, Duration::from_secs(60));
        let def_id = s.add_definition(def).await.unwrap();

        let report = s.tick().await;
        assert_eq!(report.submitted.len(), 1);
        let (fired, task_id) = report.submitted[0];
        assert_eq!(fired, def_id);

        let record = wait_for_state(h.dispatcher(), task_id, TaskState::Completed).await;
        assert_eq!(record.trigger, Trigger::Scheduled);
        assert_eq!(record.definition_id, Some(def_id));
        assert_eq!(record.priority, Priority::Background);

        let def = s.definition(def_id).await.unwrap();
        assert_eq!(def.last_run, Some(clock.now()));
        assert_eq!(def.last_task, Some(task_id));
    }

    #[tokio::test]
    async fn not_due_until_interval_elapses() {
        let clock = clock();
        let h = Harness::default().clock(clock.clone()).start().await;
        let s = h.engine.scheduler();
        let def_id = s
            .add_definition(s.define("noop", Priority::Normal, Duration::from_secs(600)))
            .await
            .unwrap();

        let (_, first) = s.tick().await.submitted[0];
        wait_for_state(h.dispatcher(), first, TaskState::Completed).await;

        clock.advance(Duration::from_secs(599));
        assert!(s.tick().await.submitted.is_empty());

        clock.advance(Duration::from_secs(1));
        let report = s.tick().await;
        assert_eq!(report.submitted.len(), 1);
        assert_eq!(report.submitted[0].0, def_id);
    }

    #[tokio::test]
    async fn active_previous_run_blocks_overlap() {
        let clock = clock();
        let gate = Gate::new();
        let h = Harness::default().clock(clock.clone()).gated(&gate).start().await;
        let s = h.engine.scheduler();
        let def_id = s
            .add_definition(s.define("gated", Priority::Normal, Duration::from_secs(60)))
            .await
            .unwrap();

        let (_, first) = s.tick().await.submitted[0];
        wait_for_state(h.dispatcher(), first, TaskState::Running).await;

        clock.advance(Duration::from_secs(120));
        let report = s.tick().await;
        assert!(report.submitted.is_empty());
        assert_eq!(report.skipped, vec![def_id]);
        // last_run is untouched by a skipped firing
        assert_eq!(
            s.definition(def_id).await.unwrap().last_run,
            Some(clock.now() - chrono::Duration::seconds(120))
        );

        gate.open(2);
        wait_for_state(h.dispatcher(), first, TaskState::Completed).await;
        let report = s.tick().await;
        assert_eq!(report.submitted.len(), 1);
        assert_ne!(report.submitted[0].1, first);
    }

    #[tokio::test]
    async fn disabled_definition_does_not_fire() {
        let clock = clock();
        let h = Harness::default().clock(clock.clone()).start().await;
        let s = h.engine.scheduler();
        let def_id = s
            .add_definition(s.define("noop", Priority::Normal, Duration::from_secs(60)))
            .await
            .unwrap();

        s.set_enabled(def_id, false).await.unwrap();
        assert_eq!(s.tick().await, TickReport::default());

        s.set_enabled(def_id, true).await.unwrap();
        assert_eq!(s.tick().await.submitted.len(), 1);
    }

    #[tokio::test]
    async fn interval_change_applies_from_last_run() {
        let clock = clock();
        let h = Harness::default().clock(clock.clone()).start().await;
        let s = h.engine.scheduler();
        let def_id = s
            .add_definition(s.define("noop", Priority::Normal, Duration::from_secs(3600)))
            .await
            .unwrap();
        let (_, first) = s.tick().await.submitted[0];
        wait_for_state(h.dispatcher(), first, TaskState::Completed).await;

        clock.advance(Duration::from_secs(300));
        assert!(s.tick().await.submitted.is_empty());

        s.set_interval(def_id, Duration::from_secs(120)).await.unwrap();
        assert_eq!(s.tick().await.submitted.len(), 1);
    }

    #[tokio::test]
    async fn rejected_firing_is_retried_next_tick() {
        let clock = clock();
        let gate = Gate::new();
        let h = Harness::default()
            .clock(clock.clone())
            .pool(Priority::Background, PoolConfig::new(1, 1))
            .gated(&gate)
            .start()
            .await;
        let d = h.dispatcher();
        let s = h.engine.scheduler();

        // occupy the single worker and the single queue slot
        let running = d.submit_manual("gated", Priority::Background, serde_json::Value::Null).await.unwrap();
        wait_for_state(d, running, TaskState::Running).await;
        let waiting = d.submit_manual("gated", Priority::Background, serde_json::Value::Null).await.unwrap();

        let def_id = s
            .add_definition(s.define("noop", Priority::Background, Duration::from_secs(60)))
            .await
            .unwrap();
        let report = s.tick().await;
        assert_eq!(report.rejected.len(), 1);
        assert!(s.definition(def_id).await.unwrap().last_run.is_none());

        gate.open(2);
        wait_for_state(d, waiting, TaskState::Completed).await;
        assert_eq!(s.tick().await.submitted.len(), 1);
    }

    #[tokio::test]
    async fn admin_operations_on_unknown_definition_fail() {
        let h = Harness::default().start().await;
        let s = h.engine.scheduler();
        let ghost = s.define("noop", Priority::Normal, Duration::from_secs(1)).id;

        assert!(matches!(s.set_enabled(ghost, false).await, Err(EngineError::DefinitionNotFound(_))));
        assert!(matches!(
            s.set_interval(ghost, Duration::from_secs(5)).await,
            Err(EngineError::DefinitionNotFound(_))
        ));
        assert!(matches!(s.run_now(ghost).await, Err(EngineError::DefinitionNotFound(_))));
        assert!(matches!(s.remove_definition(ghost).await, Err(EngineError::DefinitionNotFound(_))));
    }

    #[tokio::test]
    async fn definition_for_unregistered_type_is_rejected() {
        let h = Harness::default().start().await;
        let s = h.engine.scheduler();
        let def = s.define("nobody.handles.this", Priority::Normal, Duration::from_secs(1));
        assert!(matches!(s.add_definition(def).await, Err(EngineError::UnknownHandler(_))));
        assert!(s.definitions().await.is_empty());
    }

    #[tokio::test]
    async fn run_now_ignores_interval() {
        let clock = clock();
        let h = Harness::default().clock(clock.clone()).start().await;
        let s = h.engine.scheduler();
        let def = s
            .define("noop", Priority::High, Duration::from_secs(86_400))
            .with_last_run(clock.now())
            .disabled();
        let def_id = s.add_definition(def).await.unwrap();

        let task_id = s.run_now(def_id).await.unwrap().unwrap();
        wait_for_state(h.dispatcher(), task_id, TaskState::Completed).await;
        assert_eq!(s.definition(def_id).await.unwrap().last_task, Some(task_id));
    }

    #[tokio::test]
    async fn background_loop_fires_on_each_tick() {
        let h = Harness::default()
            .tick(Duration::from_millis(20))
            .with_scheduler_loop()
            .start()
            .await;
        let s = h.engine.scheduler();
        let def_id = s
            .add_definition(s.define("noop", Priority::Normal, Duration::ZERO))
            .await
            .unwrap();

        let mut fired = Vec::new();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(task) = s.definition(def_id).await.unwrap().last_task
                && !fired.contains(&task)
            {
                fired.push(task);
            }
            if fired.len() >= 2 {
                break;
            }
        }
        assert!(fired.len() >= 2, "scheduler loop fired {} times", fired.len());
        h.engine.shutdown(Duration::from_secs(1)).await;
    }
}
