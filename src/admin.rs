//! Read-side queries and batch operations behind the CLI.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::model::{DownloadTask, Millis, TaskStatus};
use crate::store::tasks::{self, TaskFilter};
use crate::store::{schedule_logs, subscriptions};
use crate::sync::progress::{ProgressCache, ProgressSnapshot};
use crate::sync::queue::Dispatch;

/// A task as shown to the user: durable row plus live transfer data.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: DownloadTask,
    /// Present while a transfer is reporting.
    pub live: Option<ProgressSnapshot>,
}

/// List tasks, overlaying fresh cached progress on the persisted value.
///
/// Completed rows recorded without a size get it backfilled from disk.
pub async fn list_tasks(
    pool: &SqlitePool,
    cache: &ProgressCache,
    filter: &TaskFilter,
) -> Result<Vec<TaskView>> {
    let mut views = Vec::new();
    for mut task in tasks::list(pool, filter).await? {
        let live = if task.status == TaskStatus::Downloading {
            cache.get(&task.id)
        } else {
            None
        };
        if let Some(snapshot) = live {
            task.progress = snapshot.progress.max(task.progress);
        }

        if task.status == TaskStatus::Completed
            && task.file_size == 0
            && let Some(path) = task.file_path.as_deref()
            && let Ok(meta) = tokio::fs::metadata(path).await
        {
            let size = meta.len() as i64;
            tasks::set_file_size(pool, &task.id, size).await?;
            task.file_size = size;
        }

        views.push(TaskView { task, live });
    }
    Ok(views)
}

/// Batch start: claim every task in `status` and hand it to the queue.
/// Returns how many were queued.
pub async fn retry_all(pool: &SqlitePool, dispatch: &dyn Dispatch, status: TaskStatus) -> Result<usize> {
    let mut queued = 0;
    for task_id in tasks::ids_with_status(pool, status).await? {
        if !tasks::claim(pool, &task_id).await? {
            continue;
        }
        if dispatch.dispatch(task_id.clone()) {
            queued += 1;
        } else {
            tasks::stop(pool, &task_id).await?;
        }
    }
    tracing::info!(%status, queued, "batch start");
    Ok(queued)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSummary {
    pub subscriptions: usize,
    pub enabled_subscriptions: usize,
    pub tasks_by_status: Vec<(TaskStatus, i64)>,
    pub last_sync_time: Option<Millis>,
    pub last_schedule_run: Option<Millis>,
}

pub async fn status_summary(pool: &SqlitePool) -> Result<StatusSummary> {
    let subs = subscriptions::list(pool).await?;
    Ok(StatusSummary {
        subscriptions: subs.len(),
        enabled_subscriptions: subs.iter().filter(|s| s.enabled).count(),
        tasks_by_status: tasks::count_by_status(pool).await?,
        last_sync_time: subs.iter().filter_map(|s| s.last_sync_time).max(),
        last_schedule_run: schedule_logs::recent(pool, 1)
            .await?
            .first()
            .map(|l| l.end_time),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::db::memory_db;
    use crate::model::{MediaKind, now_millis};
    use crate::store::subscriptions::tests::subscription;
    use crate::store::tasks::tests::fields;

    struct Recorder {
        accept: bool,
        ids: Mutex<Vec<String>>,
    }

    impl Dispatch for Recorder {
        fn dispatch(&self, task_id: String) -> bool {
            self.ids.lock().unwrap().push(task_id);
            self.accept
        }
    }

    async fn task(pool: &SqlitePool, media_id: &str) -> String {
        tasks::insert_new(pool, "acct", media_id, &fields(MediaKind::Video, 1))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn live_progress_overrides_persisted() {
        let pool = memory_db().await;
        let id = task(&pool, "m1").await;
        tasks::claim(&pool, &id).await.unwrap();
        tasks::update_progress(&pool, &id, 10).await.unwrap();

        let cache = ProgressCache::default();
        cache.put(
            &id,
            ProgressSnapshot {
                progress: 42,
                downloaded_bytes: 420,
                total_bytes: Some(1000),
                speed_bps: 100,
                updated_at: now_millis(),
            },
        );
        let views = list_tasks(&pool, &cache, &TaskFilter::default()).await.unwrap();
        assert_eq!(views[0].task.progress, 42);
        assert_eq!(views[0].live.unwrap().downloaded_bytes, 420);
    }

    #[tokio::test]
    async fn completed_size_is_backfilled() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        std::fs::write(&file, b"123456").unwrap();
        let pool = memory_db().await;
        let id = task(&pool, "m1").await;
        tasks::claim(&pool, &id).await.unwrap();
        tasks::complete(&pool, &id, file.to_str().unwrap(), 0, None)
            .await
            .unwrap();

        let views = list_tasks(&pool, &ProgressCache::default(), &TaskFilter::default())
            .await
            .unwrap();
        assert_eq!(views[0].task.file_size, 6);
        assert_eq!(tasks::require(&pool, &id).await.unwrap().file_size, 6);
    }

    #[tokio::test]
    async fn retry_all_claims_and_dispatches() {
        let pool = memory_db().await;
        let a = task(&pool, "m1").await;
        let b = task(&pool, "m2").await;
        for id in [&a, &b] {
            tasks::claim(&pool, id).await.unwrap();
            tasks::fail(&pool, id, "boom").await.unwrap();
        }

        let recorder = Recorder {
            accept: true,
            ids: Mutex::new(Vec::new()),
        };
        assert_eq!(retry_all(&pool, &recorder, TaskStatus::Failed).await.unwrap(), 2);
        assert_eq!(recorder.ids.lock().unwrap().len(), 2);
        assert_eq!(tasks::require(&pool, &a).await.unwrap().status, TaskStatus::Downloading);
    }

    #[tokio::test]
    async fn refused_dispatch_returns_task_to_pending() {
        let pool = memory_db().await;
        let id = task(&pool, "m1").await;
        let recorder = Recorder {
            accept: false,
            ids: Mutex::new(Vec::new()),
        };
        assert_eq!(retry_all(&pool, &recorder, TaskStatus::Pending).await.unwrap(), 0);
        assert_eq!(tasks::require(&pool, &id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn summary_counts() {
        let pool = memory_db().await;
        let mut off = subscription("b");
        off.enabled = false;
        subscriptions::insert(&pool, &subscription("acct")).await.unwrap();
        subscriptions::insert(&pool, &off).await.unwrap();
        task(&pool, "m1").await;

        let summary = status_summary(&pool).await.unwrap();
        assert_eq!(summary.subscriptions, 2);
        assert_eq!(summary.enabled_subscriptions, 1);
        assert_eq!(summary.tasks_by_status, vec![(TaskStatus::Pending, 1)]);
        assert!(summary.last_schedule_run.is_none());
    }
}
