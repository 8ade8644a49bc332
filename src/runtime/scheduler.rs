/// Background cron scheduler
///
/// Owns the fixed task roster and a tokio-cron-scheduler engine. Every fire,
/// startup catch-up run and manual trigger goes through
/// [`run_task`](crate::runtime::task::run_task) on a shared task tracker, so
/// `stop()` can cancel and wait for whatever is still in flight.

use crate::error::{Error, Result};
use crate::ledger::ExecutionLedger;
use crate::runtime::task::{run_task, Task};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Joined schedule and ledger view of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub next_run: Option<DateTime<Local>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_successful_run: Option<DateTime<Utc>>,
    pub success: bool,
}

struct SchedulerState {
    engine: Option<JobScheduler>,
    entries: HashMap<Uuid, String>, // engine job id -> task name
    ledger: Option<ExecutionLedger>,
    started: bool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl SchedulerState {
    fn empty() -> Self {
        Self {
            engine: None,
            entries: HashMap::new(),
            ledger: None,
            started: false,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }
}

pub struct Scheduler {
    tasks: Vec<Arc<dyn Task>>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(roster: Vec<Arc<dyn Task>>) -> Self {
        let mut tasks: Vec<Arc<dyn Task>> = Vec::with_capacity(roster.len());
        for task in roster {
            if tasks.iter().any(|t| t.name() == task.name()) {
                tracing::warn!("⚠️ Duplicate task name ignored: {}", task.name());
                continue;
            }
            tasks.push(task);
        }
        Self {
            tasks,
            state: Mutex::new(SchedulerState::empty()),
        }
    }

    /// Build the engine and register every roster task. No-op when already initialized.
    pub async fn initialize(&self, pool: SqlitePool) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.engine.is_some() {
            tracing::debug!("Scheduler already initialized");
            return Ok(());
        }

        tracing::info!("⏰ Initializing scheduler with {} tasks", self.tasks.len());

        let engine = JobScheduler::new().await?;
        let ledger = ExecutionLedger::new(pool);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut entries = HashMap::new();

        for task in &self.tasks {
            let job = match build_job(
                Arc::clone(task),
                ledger.clone(),
                cancel.clone(),
                tracker.clone(),
            ) {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(
                        "❌ Invalid schedule '{}' for task {}: {}",
                        task.schedule(),
                        task.name(),
                        e
                    );
                    continue;
                }
            };

            match engine.add(job).await {
                Ok(uuid) => {
                    tracing::debug!("📝 Registered {} ({}) as {}", task.name(), task.schedule(), uuid);
                    entries.insert(uuid, task.name().to_string());
                }
                Err(e) => {
                    tracing::error!("❌ Failed to register task {}: {:?}", task.name(), e);
                }
            }
        }

        tracing::info!("📊 Registered {} of {} tasks", entries.len(), self.tasks.len());

        *state = SchedulerState {
            engine: Some(engine),
            entries,
            ledger: Some(ledger),
            started: false,
            cancel,
            tracker,
        };
        Ok(())
    }

    /// Start firing jobs and launch startup catch-up runs. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(engine) = state.engine.as_ref() else {
            return Err(Error::Scheduler("scheduler not initialized".to_string()));
        };
        if state.started {
            tracing::debug!("Scheduler already started");
            return Ok(());
        }

        engine.start().await?;
        state.started = true;
        tracing::info!("✅ Scheduler started");

        let Some(ledger) = state.ledger.clone() else {
            return Ok(());
        };

        for task in self.tasks.iter().filter(|t| t.runs_on_startup()) {
            match ledger.should_run_today(task.name()).await {
                Ok(true) => {
                    tracing::info!("⏩ Startup run for {}", task.name());
                    spawn_run(&state, &ledger, Arc::clone(task));
                }
                Ok(false) => {
                    tracing::info!("⏭️ {} already succeeded today", task.name());
                }
                Err(e) => {
                    tracing::warn!("⚠️ Could not read ledger for {}: {}", task.name(), e);
                }
            }
        }
        Ok(())
    }

    /// Stop firing, cancel in-flight runs and wait for them. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(mut engine) = state.engine.take() else {
            tracing::debug!("Scheduler not running");
            return Ok(());
        };

        tracing::info!("⏹️ Stopping scheduler");
        if let Err(e) = engine.shutdown().await {
            tracing::warn!("⚠️ Scheduler engine shutdown failed: {:?}", e);
        }

        state.cancel.cancel();
        state.tracker.close();
        let tracker = state.tracker.clone();
        *state = SchedulerState::empty();
        drop(state);

        tracker.wait().await;
        tracing::info!("✅ Scheduler stopped");
        Ok(())
    }

    /// Next fire instant per task. Empty unless started.
    pub async fn next_run_times(&self) -> HashMap<String, DateTime<Local>> {
        let mut state = self.state.lock().await;
        let mut next = HashMap::new();
        if !state.started {
            return next;
        }

        let SchedulerState {
            engine, entries, ..
        } = &mut *state;
        let Some(engine) = engine.as_mut() else {
            return next;
        };

        for (uuid, name) in entries.iter() {
            match engine.next_tick_for_job(*uuid).await {
                Ok(Some(tick)) => {
                    next.insert(name.clone(), tick.with_timezone(&Local));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("⚠️ No next tick for {}: {:?}", name, e),
            }
        }
        next
    }

    /// Run a roster task now, outside its schedule.
    pub async fn trigger(&self, name: &str) -> Result<()> {
        let task = self
            .tasks
            .iter()
            .find(|t| t.name() == name)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("unknown task: {name}")))?;

        let state = self.state.lock().await;
        let Some(ledger) = state.ledger.clone() else {
            return Err(Error::Configuration(
                "scheduler not initialized".to_string(),
            ));
        };

        tracing::info!("🔔 Manual trigger: {}", name);
        spawn_run(&state, &ledger, task);
        Ok(())
    }

    /// Schedule and ledger state for every roster task, sorted by name
    pub async fn status(&self) -> Result<Vec<TaskStatus>> {
        let ledger = self
            .state
            .lock()
            .await
            .ledger
            .clone()
            .ok_or_else(|| Error::Configuration("scheduler not initialized".to_string()))?;
        let mut next = self.next_run_times().await;

        let mut statuses = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let record = ledger.get(task.name()).await?;
            statuses.push(TaskStatus {
                name: task.name().to_string(),
                next_run: next.remove(task.name()),
                last_run: record.as_ref().map(|r| r.last_run),
                last_successful_run: record.as_ref().and_then(|r| r.last_successful_run),
                success: record.map(|r| r.success).unwrap_or(false),
            });
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(statuses)
    }
}

fn spawn_run(state: &SchedulerState, ledger: &ExecutionLedger, task: Arc<dyn Task>) {
    spawn_tracked(&state.tracker, &state.cancel, ledger.clone(), task);
}

/// Spawn a run unless shutdown has begun; returns whether it was spawned.
///
/// The tracker token is taken before the cancellation check, so a `stop()`
/// that cancels after the check is still waiting on this run.
fn spawn_tracked(
    tracker: &TaskTracker,
    cancel: &CancellationToken,
    ledger: ExecutionLedger,
    task: Arc<dyn Task>,
) -> bool {
    let token = tracker.token();
    if cancel.is_cancelled() || tracker.is_closed() {
        tracing::debug!("⏭️ Skipping run of {} during shutdown", task.name());
        return false;
    }
    let cancel = cancel.clone();
    tracker.spawn(async move {
        run_task(&ledger, task, cancel).await;
    });
    drop(token);
    true
}

fn build_job(
    task: Arc<dyn Task>,
    ledger: ExecutionLedger,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> Result<Job> {
    let schedule = task.schedule().to_string();
    let job = Job::new_async_tz(schedule.as_str(), Local, move |_uuid, _l| {
        let task = Arc::clone(&task);
        let ledger = ledger.clone();
        let cancel = cancel.clone();
        let tracker = tracker.clone();

        Box::pin(async move {
            tracing::debug!("🔔 Cron fire: {}", task.name());
            spawn_tracked(&tracker, &cancel, ledger, task);
        })
    })?;
    Ok(job)
}
