//! Periodic trigger that syncs every enabled subscription.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{RunStatus, ScheduleLog, new_id};
use crate::store::schedule_logs;
use crate::sync::{SubscriptionRun, SyncEngine};

struct Running {
    interval: Duration,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owned scheduler. At most one tick loop runs per instance.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    pool: SqlitePool,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            engine,
            pool,
            running: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state().as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    pub fn interval(&self) -> Option<Duration> {
        self.state().as_ref().map(|r| r.interval)
    }

    /// Start ticking every `interval`, first tick one interval from now.
    /// Returns `false` if already running.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        let mut state = self.state();
        if state.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { scheduler.run_loop(interval, token).await });
        *state = Some(Running {
            interval,
            cancel,
            handle,
        });
        tracing::info!(interval_secs = interval.as_secs(), "scheduler started");
        true
    }

    /// Stop ticking. A tick already in progress is allowed to finish.
    /// Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.state().take() else {
            return false;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            tracing::error!(error = %e, "scheduler loop ended abnormally");
        }
        tracing::info!("scheduler stopped");
        true
    }

    pub async fn restart(self: &Arc<Self>, interval: Duration) {
        self.stop().await;
        self.start(interval);
    }

    async fn run_loop(&self, interval: Duration, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(interval.max(Duration::from_secs(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await; // consume the initial instant tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    tracing::debug!("scheduled sync tick");
                    if let Err(e) = self.run_now().await {
                        tracing::error!(error = %e, "scheduled sync failed");
                    }
                }
            }
        }
    }

    /// One tick: sync every enabled subscription and log each outcome.
    pub async fn run_now(&self) -> Result<Vec<ScheduleLog>> {
        let runs = self.engine.sync_all().await?;
        let mut logs = Vec::with_capacity(runs.len());
        for run in &runs {
            let log = schedule_log(run);
            if let Err(e) = schedule_logs::insert(&self.pool, &log).await {
                tracing::error!(error = %e, "failed to write schedule log");
            }
            logs.push(log);
        }
        let failed = logs.iter().filter(|l| l.status == RunStatus::Failed).count();
        tracing::info!(subscriptions = logs.len(), failed, "scheduled sync finished");
        Ok(logs)
    }
}

fn schedule_log(run: &SubscriptionRun) -> ScheduleLog {
    let sub = &run.subscription;
    let (status, message, details) = match &run.result {
        Ok(result) => (
            RunStatus::Success,
            format!(
                "{}: {} new, {} queued",
                sub.display_name,
                result.new_task_count,
                result.queued.len()
            ),
            serde_json::json!({
                "subscription_id": sub.id,
                "account_id": sub.account_id,
                "fetched_count": result.fetched_count,
                "filtered_count": result.filtered_count,
                "new_task_count": result.new_task_count,
                "queued_count": result.queued.len(),
                "requeued_missing": result.requeued_missing,
                "downloaded_count": result.downloaded_count,
            }),
        ),
        Err(e) => (
            RunStatus::Failed,
            format!("{}: {e}", sub.display_name),
            serde_json::json!({
                "subscription_id": sub.id,
                "account_id": sub.account_id,
                "error": e.to_string(),
            }),
        ),
    };
    ScheduleLog {
        id: new_id(),
        start_time: run.started_at,
        end_time: run.finished_at,
        status,
        message,
        details,
    }
}
