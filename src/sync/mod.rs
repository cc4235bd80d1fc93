pub mod cleanup;
pub mod downloader;
pub mod progress;
pub mod queue;
pub mod reconciler;
pub mod watcher;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::ConfigSource;
use crate::error::{Error, Result};
use crate::fetcher::{FetchRequest, MediaFetcher, MediaItem};
use crate::model::{Millis, RunStatus, Subscription, now_millis};
use crate::store::tasks::RemoteFields;
use crate::store::{history, subscriptions, tasks};

use queue::Dispatch;
use reconciler::{SkipReason, TaskAction};

/// Counters reported by one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    /// Items returned by the fetcher, before filtering.
    pub fetched_count: usize,
    /// Items dropped by the engagement threshold.
    pub filtered_count: usize,
    pub new_task_count: usize,
    /// Tasks moved to `downloading` and handed to the queue, oldest first.
    pub queued: Vec<String>,
    /// Completed tasks whose files vanished and were queued again.
    pub requeued_missing: usize,
    /// Completed tasks whose files vanished after the item left the remote list.
    pub dangling: usize,
    /// Row writes against `download_tasks` made by this cycle.
    pub task_writes: usize,
    pub downloaded_count: i64,
}

/// Outcome of one subscription within [`SyncEngine::sync_all`].
#[derive(Debug)]
pub struct SubscriptionRun {
    pub subscription: Subscription,
    pub started_at: Millis,
    pub finished_at: Millis,
    pub result: Result<SyncResult>,
}

/// Drives sync cycles: fetch, filter, reconcile, dispatch, record.
pub struct SyncEngine {
    pool: SqlitePool,
    fetcher: Arc<dyn MediaFetcher>,
    config: ConfigSource,
    dispatch: Arc<dyn Dispatch>,
}

impl SyncEngine {
    pub fn new(
        pool: SqlitePool,
        fetcher: Arc<dyn MediaFetcher>,
        config: ConfigSource,
        dispatch: Arc<dyn Dispatch>,
    ) -> Self {
        Self {
            pool,
            fetcher,
            config,
            dispatch,
        }
    }

    /// Sync one subscription and append its history entry.
    pub async fn sync(&self, subscription_id: &str) -> Result<SyncResult> {
        let subscription = subscriptions::require(&self.pool, subscription_id).await?;
        tracing::info!(
            subscription_id,
            account_id = %subscription.account_id,
            name = %subscription.display_name,
            "syncing subscription"
        );

        match self.run(&subscription).await {
            Ok(result) => {
                history::record(
                    &self.pool,
                    subscription_id,
                    RunStatus::Success,
                    result.new_task_count as i64,
                    result.queued.len() as i64,
                    None,
                )
                .await?;
                tracing::info!(
                    subscription_id,
                    fetched = result.fetched_count,
                    filtered = result.filtered_count,
                    new = result.new_task_count,
                    queued = result.queued.len(),
                    "sync complete"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!(subscription_id, error = %e, "sync failed");
                if let Err(record_err) = history::record(
                    &self.pool,
                    subscription_id,
                    RunStatus::Failed,
                    0,
                    0,
                    Some(&e.to_string()),
                )
                .await
                {
                    tracing::error!(subscription_id, error = %record_err, "failed to record sync history");
                }
                Err(e)
            }
        }
    }

    /// Sync every enabled subscription in turn, pausing between them. One
    /// subscription's failure does not affect the others.
    pub async fn sync_all(&self) -> Result<Vec<SubscriptionRun>> {
        let delay = self.config.load()?.general.subscription_delay();
        let enabled = subscriptions::list_enabled(&self.pool).await?;
        let total = enabled.len();
        let mut runs = Vec::with_capacity(total);

        for (index, subscription) in enabled.into_iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            tracing::debug!("subscription {}/{}", index + 1, total);
            let started_at = now_millis();
            let result = self.sync(&subscription.id).await;
            runs.push(SubscriptionRun {
                subscription,
                started_at,
                finished_at: now_millis(),
                result,
            });
        }
        Ok(runs)
    }

    async fn run(&self, subscription: &Subscription) -> Result<SyncResult> {
        let cfg = self.config.load()?;
        let today = chrono::Local::now().date_naive();
        let request = FetchRequest {
            account_id: subscription.account_id.clone(),
            range: subscription.time_range.date_range(today),
            limit: None,
        };

        let response = self.fetcher.fetch(&request).await?;
        if !response.is_success(&cfg.api.success_marker) {
            return Err(Error::Fetch(format!(
                "media API reported failure: {}",
                if response.message.is_empty() {
                    "<no message>"
                } else {
                    response.message.as_str()
                }
            )));
        }

        let fetched = response.items;
        let filtered = reconciler::filter_by_engagement(&fetched, subscription.min_engagement);
        let mut result = SyncResult {
            fetched_count: fetched.len(),
            filtered_count: fetched.len() - filtered.len(),
            ..Default::default()
        };
        tracing::debug!(
            fetched = result.fetched_count,
            dropped = result.filtered_count,
            min_engagement = ?subscription.min_engagement,
            "engagement filter applied"
        );

        let exists = |p: &Path| p.exists();
        let mut handled: HashSet<String> = HashSet::new();

        let reconciled: Result<()> = async {
            if subscription.auto_download {
                self.reconcile_items(subscription, &filtered, &exists, &mut result, &mut handled)
                    .await?;
            } else {
                tracing::debug!("auto download disabled, not creating tasks");
            }
            self.requeue_missing(subscription, &fetched, &handled, &exists, &mut result)
                .await
        }
        .await;

        // Tasks claimed before a failure are still handed off.
        self.dispatch_claimed(&result.queued).await;
        reconciled?;

        result.downloaded_count =
            subscriptions::refresh_downloaded_count(&self.pool, &subscription.account_id).await?;
        subscriptions::record_sync(
            &self.pool,
            &subscription.id,
            result.fetched_count as i64,
            fetched.first().map(|item| item.id.as_str()),
            now_millis(),
        )
        .await?;

        Ok(result)
    }

    async fn reconcile_items(
        &self,
        subscription: &Subscription,
        filtered: &[MediaItem],
        exists: &impl Fn(&Path) -> bool,
        result: &mut SyncResult,
        handled: &mut HashSet<String>,
    ) -> Result<()> {
        let mut existing = HashMap::new();
        for item in filtered {
            if let Some(task) = tasks::get_by_media_id(&self.pool, &item.id).await? {
                existing.insert(item.id.clone(), task);
            }
        }
        let by_id: HashMap<&str, &MediaItem> =
            filtered.iter().map(|item| (item.id.as_str(), item)).collect();

        for action in reconciler::reconcile(filtered, &existing, exists) {
            let Some(item) = by_id.get(action.media_id()) else {
                continue;
            };
            if let Some(task) = existing.get(action.media_id()) {
                handled.insert(task.id.clone());
            }
            if let Err(e) = self
                .apply_action(&subscription.account_id, &action, item, result)
                .await
            {
                tracing::error!(media_id = %item.id, action = ?action, error = %e, "reconcile action failed");
            }
        }
        Ok(())
    }

    async fn apply_action(
        &self,
        account_id: &str,
        action: &TaskAction,
        item: &MediaItem,
        result: &mut SyncResult,
    ) -> Result<()> {
        let fields = RemoteFields::from_item(item);
        match action {
            TaskAction::Create { media_id } => {
                let Some(task_id) = tasks::insert_new(&self.pool, account_id, media_id, &fields).await?
                else {
                    tracing::debug!(media_id, "media already tracked elsewhere");
                    return Ok(());
                };
                result.new_task_count += 1;
                result.task_writes += 1;
                tracing::debug!(media_id, task_id, kind = %item.kind, "new task");
                self.claim(&task_id, result).await?;
            }
            TaskAction::Redownload {
                task_id,
                media_id,
                reason,
            } => {
                if tasks::refresh_metadata(&self.pool, media_id, &fields).await? {
                    result.task_writes += 1;
                }
                tracing::debug!(media_id, task_id, ?reason, "redownloading");
                self.claim(task_id, result).await?;
            }
            TaskAction::Skip { media_id, reason } => {
                if *reason != SkipReason::Active
                    && tasks::refresh_metadata(&self.pool, media_id, &fields).await?
                {
                    result.task_writes += 1;
                }
                tracing::trace!(media_id, ?reason, "skipping");
            }
        }
        Ok(())
    }

    /// Sweep completed tasks of the account for vanished files.
    async fn requeue_missing(
        &self,
        subscription: &Subscription,
        fetched: &[MediaItem],
        handled: &HashSet<String>,
        exists: &impl Fn(&Path) -> bool,
        result: &mut SyncResult,
    ) -> Result<()> {
        let completed = tasks::list_completed_for_account(&self.pool, &subscription.account_id).await?;
        let listed: HashSet<&str> = fetched.iter().map(|item| item.id.as_str()).collect();
        let handled: HashSet<&str> = handled.iter().map(String::as_str).collect();

        let missing = reconciler::missing_file_pass(&completed, &listed, &handled, exists);
        for task_id in &missing.dangling {
            tracing::warn!(task_id, "file missing and item no longer listed, not redownloading");
        }
        result.dangling = missing.dangling.len();

        for task_id in missing.requeue {
            tracing::info!(task_id, "file missing, redownloading");
            if self.claim(&task_id, result).await? {
                result.requeued_missing += 1;
            }
        }
        Ok(())
    }

    /// Hand claimed tasks to the queue. A refused task goes back to `pending`.
    async fn dispatch_claimed(&self, queued: &[String]) {
        for task_id in queued {
            if self.dispatch.dispatch(task_id.clone()) {
                continue;
            }
            tracing::warn!(task_id, "queue refused task, returning it to pending");
            if let Err(e) = tasks::stop(&self.pool, task_id).await {
                tracing::error!(task_id, error = %e, "failed to release refused task");
            }
        }
    }

    /// Move a task to `downloading` before it is handed to the queue.
    async fn claim(&self, task_id: &str, result: &mut SyncResult) -> Result<bool> {
        let claimed = tasks::claim(&self.pool, task_id).await?;
        if claimed {
            result.task_writes += 1;
            result.queued.push(task_id.to_string());
        }
        Ok(claimed)
    }
}
