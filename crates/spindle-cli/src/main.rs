use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use spindle_core::domain::TaskRecord;
use spindle_core::{
    EngineBuilder, EngineConfig, Handler, Priority, ProgressReporter, Task, TaskContext, TaskError,
    TaskHandler, TaskId, TaskState,
};

#[derive(Debug, Serialize, Deserialize)]
struct RefreshLibrary {
    section: String,
    items: u32,
}

impl Task for RefreshLibrary {
    const TYPE: &'static str = "library.refresh.v1";
}

struct RefreshLibraryHandler;

#[async_trait]
impl Handler<RefreshLibrary> for RefreshLibraryHandler {
    fn description(&self) -> &str {
        "Rescan one library section"
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        task: RefreshLibrary,
        progress: &ProgressReporter,
    ) -> Result<(), TaskError> {
        let total = task.items.max(1);
        for i in 1..=total {
            ctx.checkpoint()?;
            sleep(Duration::from_millis(40)).await;
            let percent = (i * 100 / total) as u8;
            progress
                .report(percent, format!("{}: {i}/{total}", task.section))
                .await;
        }
        Ok(())
    }
}

/// Fails the first `n` runs, then succeeds. Nothing is retried automatically.
struct FlakyHandler {
    remaining_failures: AtomicU32,
}

impl FlakyHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    fn name(&self) -> &str {
        "hello"
    }

    async fn execute(
        &self,
        _ctx: &TaskContext,
        task: &TaskRecord,
        _progress: &ProgressReporter,
    ) -> Result<(), TaskError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(TaskError::failed(format!("intentional failure (left={left})")));
        }
        println!("Hello, {}!", task.payload["name"].as_str().unwrap_or("spindle"));
        Ok(())
    }
}

struct Housekeeping;

#[async_trait]
impl TaskHandler for Housekeeping {
    fn name(&self) -> &str {
        "housekeeping"
    }

    async fn execute(
        &self,
        _ctx: &TaskContext,
        task: &TaskRecord,
        _progress: &ProgressReporter,
    ) -> Result<(), TaskError> {
        info!(task_id = %task.id, "housekeeping pass");
        Ok(())
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,spindle_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// First argument, if any, is a JSON `EngineConfig`; missing fields keep
/// their defaults.
fn load_config() -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        None => Ok(EngineConfig::default()),
    }
}

async fn wait_terminal(
    engine: &spindle_core::Engine,
    ids: &[TaskId],
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let mut pending = 0;
        for id in ids {
            if !engine.dispatcher().status(*id).await?.is_terminal() {
                pending += 1;
            }
        }
        if pending == 0 {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = load_config()?;

    // (A) handlers and recurring work
    let engine = EngineBuilder::new()
        .config(config)
        .register_typed::<RefreshLibrary, _>(RefreshLibraryHandler)?
        .register("hello", Arc::new(FlakyHandler::new(1)))?
        .register("housekeeping", Arc::new(Housekeeping))?
        .schedule("housekeeping", Priority::Background, Duration::from_secs(2))
        .expect_tasks(&[RefreshLibrary::TYPE, "hello", "housekeeping"])
        .build()
        .await?;
    let dispatcher = engine.dispatcher();

    // (B) submissions across priorities
    let mut ids = Vec::new();
    for (section, items) in [("movies", 10), ("shows", 25)] {
        let task = RefreshLibrary {
            section: section.to_string(),
            items,
        };
        ids.push(dispatcher.submit_typed(&task, Priority::Normal).await?);
    }
    let hello = serde_json::json!({ "name": "spindle" });
    ids.push(dispatcher.submit_manual("hello", Priority::High, hello.clone()).await?);
    ids.push(dispatcher.submit_manual("hello", Priority::High, hello).await?);

    // (C) one long refresh that gets cancelled mid-flight
    let doomed = dispatcher
        .submit_typed(
            &RefreshLibrary {
                section: "music".to_string(),
                items: 200,
            },
            Priority::Background,
        )
        .await?;
    ids.push(doomed);
    sleep(Duration::from_millis(300)).await;
    dispatcher.cancel(doomed).await?;

    // (D) poll until everything settles
    wait_terminal(&engine, &ids).await?;
    for id in &ids {
        let record = dispatcher.status(*id).await?;
        println!(
            "{} {:<20} {:<10} {:>3}% error={:?}",
            record.id, record.task_type, record.state, record.progress.percent, record.error
        );
    }
    for state in [TaskState::Completed, TaskState::Failed, TaskState::Cancelled] {
        println!("{state}: {}", dispatcher.list_by_status(state).await?.len());
    }

    // (E) let the scheduler fire a few times, or stop early on Ctrl-C
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = sleep(Duration::from_secs(5)) => {}
    }
    println!("{}", serde_json::to_string_pretty(&dispatcher.engine_status().await)?);

    let report = engine.shutdown_default().await;
    println!(
        "shutdown: signalled={} abandoned={} left_queued={}",
        report.signalled,
        report.abandoned.len(),
        report.left_queued.len()
    );
    Ok(())
}
