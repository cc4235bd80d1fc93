use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::tasks;

/// Start watching the download directory for removed files.
///
/// Returns a receiver of paths that changed and no longer exist. Events are
/// debounced so a burst of deletions (a whole folder) arrives in one batch.
///
/// The watcher runs until the returned `WatcherHandle` is dropped.
pub fn start_deletion_watcher(
    root: &Path,
    debounce_ms: u64,
) -> Result<(mpsc::UnboundedReceiver<PathBuf>, WatcherHandle)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut debouncer = new_debouncer(
        Duration::from_millis(debounce_ms),
        move |result: Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
            match result {
                Ok(events) => {
                    for event in events {
                        if event.kind != DebouncedEventKind::Any {
                            continue;
                        }
                        if !event.path.exists() {
                            let _ = tx.send(event.path);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "deletion watcher error");
                }
            }
        },
    )
    .context("Failed to create file watcher")?;

    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create download directory: {}", root.display()))?;
    debouncer
        .watcher()
        .watch(root, notify::RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;
    tracing::info!(root = %root.display(), "watching for removed downloads");

    Ok((
        rx,
        WatcherHandle {
            _debouncer: debouncer,
        },
    ))
}

/// Handle that keeps the watcher alive. Drop to stop watching.
pub struct WatcherHandle {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

/// `completed → deleted` for the task whose canonical file was removed.
pub async fn handle_removal(pool: &SqlitePool, path: &Path) -> crate::error::Result<u64> {
    if path.exists() {
        return Ok(0);
    }
    let marked = tasks::mark_deleted_by_path(pool, &path.to_string_lossy()).await?;
    if marked > 0 {
        tracing::info!(path = %path.display(), "downloaded file removed, task marked deleted");
    }
    Ok(marked)
}

/// Sweep every completed task and mark those whose file is gone.
/// Catches removals the watcher missed (daemon down, unwatched mounts).
pub async fn check_missing(pool: &SqlitePool) -> crate::error::Result<usize> {
    let mut marked = 0;
    for task in tasks::list_completed(pool).await? {
        let Some(path) = task.file_path.as_deref().filter(|p| !p.is_empty()) else {
            continue;
        };
        if !Path::new(path).exists() && tasks::mark_deleted(pool, &task.id).await? {
            tracing::info!(task_id = %task.id, path, "downloaded file missing, task marked deleted");
            marked += 1;
        }
    }
    Ok(marked)
}

/// Consume watcher events and run the periodic check until cancelled.
pub async fn run(
    pool: SqlitePool,
    mut removals: mpsc::UnboundedReceiver<PathBuf>,
    check_interval: Duration,
    cancel: CancellationToken,
) {
    let mut check = tokio::time::interval(check_interval.max(Duration::from_secs(1)));
    check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(path) = removals.recv() => {
                if let Err(e) = handle_removal(&pool, &path).await {
                    tracing::error!(path = %path.display(), error = %e, "failed to record removal");
                }
            }
            _ = check.tick() => {
                match check_missing(&pool).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(count = n, "periodic check marked tasks deleted"),
                    Err(e) => tracing::error!(error = %e, "periodic deletion check failed"),
                }
            }
        }
    }
    tracing::debug!("deletion watcher stopped");
}
