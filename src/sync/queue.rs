use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::downloader::{DownloadExecutor, DownloadOutcome};

/// Where the sync engine hands claimed tasks.
pub trait Dispatch: Send + Sync {
    /// Queue an already-claimed task. Returns `false` if it was not accepted.
    fn dispatch(&self, task_id: String) -> bool;
}

/// Bounded-concurrency download queue.
///
/// Tasks are dispatched in arrival order with a fixed pause between
/// dispatches; at most `max_concurrent` execute at once.
pub struct DownloadQueue {
    tx: mpsc::UnboundedSender<String>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DownloadQueue {
    pub fn spawn(
        executor: Arc<DownloadExecutor>,
        max_concurrent: usize,
        dispatch_delay: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());
        let tracker = TaskTracker::new();

        let worker = Dispatcher {
            executor,
            rx,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            dispatch_delay,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
            outstanding: outstanding.clone(),
            idle: idle.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Arc::new(Self {
            tx,
            outstanding,
            idle,
            cancel,
            tracker,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    /// Tasks queued or executing.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every queued task has finished executing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop dispatching, return undispatched and in-flight tasks to `pending`,
    /// and wait for the workers to wind down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            let _ = handle.await;
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Dispatch for DownloadQueue {
    fn dispatch(&self, task_id: String) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        match self.tx.send(task_id) {
            Ok(()) => true,
            Err(mpsc::error::SendError(task_id)) => {
                tracing::warn!(task_id, "download queue closed, task not dispatched");
                release(&self.outstanding, &self.idle);
                false
            }
        }
    }
}

fn release(outstanding: &AtomicUsize, idle: &Notify) {
    if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
        idle.notify_waiters();
    }
}

struct Dispatcher {
    executor: Arc<DownloadExecutor>,
    rx: mpsc::UnboundedReceiver<String>,
    semaphore: Arc<Semaphore>,
    dispatch_delay: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            let task_id = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(id) => id,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.abandon(task_id).await;
                    break;
                }
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let executor = self.executor.clone();
            let cancel = self.cancel.clone();
            let outstanding = self.outstanding.clone();
            let idle = self.idle.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                tokio::select! {
                    result = executor.execute_claimed(&task_id) => match result {
                        Ok(DownloadOutcome::Completed { file_path, .. }) => {
                            tracing::debug!(task_id, path = %file_path.display(), "queued download finished");
                        }
                        Ok(outcome) => tracing::debug!(task_id, ?outcome, "queued download ended"),
                        Err(e) => tracing::error!(task_id, error = %e, "queued download failed"),
                    },
                    _ = cancel.cancelled() => {
                        if let Err(e) = executor.stop(&task_id).await {
                            tracing::warn!(task_id, error = %e, "failed to return task to pending");
                        }
                    }
                }
                release(&outstanding, &idle);
            });

            if !self.dispatch_delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.dispatch_delay) => {}
                }
            }
        }

        self.rx.close();
        while let Ok(task_id) = self.rx.try_recv() {
            self.abandon(task_id).await;
        }
    }

    /// Claimed but never started: hand the task back to `pending`.
    async fn abandon(&self, task_id: String) {
        if let Err(e) = self.executor.stop(&task_id).await {
            tracing::warn!(task_id, error = %e, "failed to return task to pending");
        }
        release(&self.outstanding, &self.idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigSource};
    use crate::db::memory_db;
    use crate::model::{MediaKind, TaskStatus};
    use crate::store::tasks::{self, tests::fields};
    use crate::sync::progress::ProgressCache;
    use crate::test_support::serve_files;

    async fn setup(dir: &std::path::Path) -> (sqlx::SqlitePool, Arc<DownloadExecutor>) {
        let pool = memory_db().await;
        let mut cfg = Config::default();
        cfg.download.download_dir = dir.to_path_buf();
        cfg.download.nfo_format = crate::config::NfoFormat::None;
        let exec = DownloadExecutor::new(
            pool.clone(),
            ConfigSource::Fixed(Box::new(cfg)),
            Arc::new(ProgressCache::default()),
        )
        .unwrap();
        (pool, Arc::new(exec))
    }

    #[tokio::test]
    async fn queued_tasks_run_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, exec) = setup(dir.path()).await;
        let base = serve_files(vec![("/a.mp4", b"aaaa".to_vec()), ("/b.mp4", b"bb".to_vec())]).await;

        let mut ids = Vec::new();
        for (media, path) in [("m1", "/a.mp4"), ("m2", "/b.mp4")] {
            let mut f = fields(MediaKind::Video, 1);
            f.description = media.into();
            f.primary_download_url = format!("{base}{path}");
            let id = tasks::insert_new(&pool, "acct", media, &f).await.unwrap().unwrap();
            tasks::claim(&pool, &id).await.unwrap();
            ids.push(id);
        }

        let queue = DownloadQueue::spawn(exec, 1, Duration::ZERO, CancellationToken::new());
        for id in &ids {
            assert!(queue.dispatch(id.clone()));
        }
        queue.wait_idle().await;
        assert_eq!(queue.outstanding(), 0);

        for id in &ids {
            let task = tasks::require(&pool, id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
        }
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn failures_do_not_stop_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, exec) = setup(dir.path()).await;
        let base = serve_files(vec![("/ok.mp4", b"ok".to_vec())]).await;

        let mut bad = fields(MediaKind::Video, 1);
        bad.description = "bad".into();
        bad.primary_download_url = format!("{base}/missing.mp4");
        let mut good = fields(MediaKind::Video, 1);
        good.description = "good".into();
        good.primary_download_url = format!("{base}/ok.mp4");

        let bad_id = tasks::insert_new(&pool, "acct", "bad", &bad).await.unwrap().unwrap();
        let good_id = tasks::insert_new(&pool, "acct", "good", &good).await.unwrap().unwrap();
        tasks::claim(&pool, &bad_id).await.unwrap();
        tasks::claim(&pool, &good_id).await.unwrap();

        let queue = DownloadQueue::spawn(exec, 2, Duration::ZERO, CancellationToken::new());
        queue.dispatch(bad_id.clone());
        queue.dispatch(good_id.clone());
        queue.wait_idle().await;

        assert_eq!(
            tasks::require(&pool, &bad_id).await.unwrap().status,
            TaskStatus::Failed
        );
        assert_eq!(
            tasks::require(&pool, &good_id).await.unwrap().status,
            TaskStatus::Completed
        );
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_queue_refuses_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, exec) = setup(dir.path()).await;
        let id = tasks::insert_new(&pool, "acct", "m1", &fields(MediaKind::Video, 1))
            .await
            .unwrap()
            .unwrap();
        tasks::claim(&pool, &id).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let queue = DownloadQueue::spawn(exec, 1, Duration::ZERO, cancel);
        assert!(!queue.dispatch(id.clone()));
        queue.shutdown().await;

        assert_eq!(
            tasks::require(&pool, &id).await.unwrap().status,
            TaskStatus::Downloading
        );
    }
}
