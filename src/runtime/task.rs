/// Task contract and the ledger-bracketed runner

use crate::error::Result;
use crate::ledger::ExecutionLedger;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// A named, cron-scheduled unit of background work
#[async_trait]
pub trait Task: Send + Sync {
    /// Unique name; also the ledger key
    fn name(&self) -> &str;

    /// Six-field cron expression (sec min hour dom mon dow), local time
    fn schedule(&self) -> &str;

    /// Catch up at process start if today's successful run is missing
    fn runs_on_startup(&self) -> bool;

    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

/// Run one execution of `task`, recording it in the ledger.
///
/// The start mark is written before the body runs and the success mark only
/// after a clean return. Ledger failures are logged and do not stop the task;
/// task failures end here.
pub async fn run_task(ledger: &ExecutionLedger, task: Arc<dyn Task>, cancel: CancellationToken) {
    let name = task.name().to_string();
    tracing::info!("🚀 Running task: {}", name);

    if let Err(e) = ledger.update_last_run(&name).await {
        tracing::error!("❌ Failed to record start of {}: {}", name, e);
    }

    let started = Instant::now();
    match task.run(cancel).await {
        Ok(()) => {
            tracing::info!("✅ Task completed: {} in {:?}", name, started.elapsed());
            if let Err(e) = ledger.update_last_successful_run(&name).await {
                tracing::error!("❌ Failed to record success of {}: {}", name, e);
            }
        }
        Err(e) => {
            tracing::error!(
                "❌ Task failed: {} after {:?} - Error: {}",
                name,
                started.elapsed(),
                e
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted task that records what the ledger looked like when it ran
    pub(crate) struct ScriptedTask {
        pub name: String,
        pub schedule: String,
        pub on_startup: bool,
        pub fail: bool,
        pub ledger: Option<ExecutionLedger>,
        /// Park until cancelled, then take a little longer to wind down
        pub until_cancelled: bool,
        pub runs: AtomicU32,
        pub seen_in_progress: Mutex<Vec<bool>>,
        pub saw_cancel: AtomicBool,
        pub finished: AtomicBool,
    }

    impl ScriptedTask {
        pub(crate) fn new(name: &str, schedule: &str, on_startup: bool) -> Self {
            Self {
                name: name.to_string(),
                schedule: schedule.to_string(),
                on_startup,
                fail: false,
                ledger: None,
                until_cancelled: false,
                runs: AtomicU32::new(0),
                seen_in_progress: Mutex::new(Vec::new()),
                saw_cancel: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }
        }

        pub(crate) fn runs(&self) -> u32 {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Task for ScriptedTask {
        fn name(&self) -> &str {
            &self.name
        }

        fn schedule(&self) -> &str {
            &self.schedule
        }

        fn runs_on_startup(&self) -> bool {
            self.on_startup
        }

        async fn run(&self, cancel: CancellationToken) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.until_cancelled {
                cancel.cancelled().await;
                self.saw_cancel.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(150)).await;
                self.finished.store(true, Ordering::SeqCst);
                return Err(Error::Task("cancelled".into()));
            }
            if let Some(ledger) = &self.ledger {
                // a started-but-unfinished row reads as success = false
                let in_progress = ledger
                    .get(&self.name)
                    .await?
                    .map(|row| !row.success)
                    .unwrap_or(false);
                self.seen_in_progress.lock().unwrap().push(in_progress);
            }
            if self.fail {
                return Err(Error::Task("scripted failure".into()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedTask;
    use super::*;
    use crate::storage::database::test_pool;

    #[tokio::test]
    async fn start_is_recorded_before_body_and_success_after() {
        let (_dir, pool) = test_pool().await;
        let ledger = ExecutionLedger::new(pool);
        let mut task = ScriptedTask::new("t", "0 0 16 * * *", false);
        task.ledger = Some(ledger.clone());
        let task = Arc::new(task);

        run_task(&ledger, task.clone(), CancellationToken::new()).await;

        assert_eq!(task.runs(), 1);
        assert_eq!(*task.seen_in_progress.lock().unwrap(), vec![true]);
        let row = ledger.get("t").await.unwrap().unwrap();
        assert!(row.success);
        assert!(row.last_successful_run.is_some());
    }

    #[tokio::test]
    async fn failure_leaves_row_unsuccessful() {
        let (_dir, pool) = test_pool().await;
        let ledger = ExecutionLedger::new(pool);
        let mut task = ScriptedTask::new("t", "0 0 16 * * *", false);
        task.fail = true;

        run_task(&ledger, Arc::new(task), CancellationToken::new()).await;

        let row = ledger.get("t").await.unwrap().unwrap();
        assert!(!row.success);
        assert_eq!(row.last_successful_run, None);
        assert!(ledger.should_run_today("t").await.unwrap());
    }
}
