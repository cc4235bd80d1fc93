use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sqlx::SqlitePool;

use super::reconciler;
use crate::config::Config;
use crate::error::Result;
use crate::model::{DownloadTask, MediaKind};
use crate::nfo;
use crate::store::{subscriptions, tasks};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub tasks_deleted: u64,
    pub files_removed: usize,
    pub dirs_removed: usize,
}

/// Every on-disk artifact belonging to a task: media files (all image-set
/// siblings), sidecars, and leftover partial downloads.
pub fn task_artifacts(task: &DownloadTask) -> Vec<PathBuf> {
    let mut paths = reconciler::expected_files(task);
    if task.kind == MediaKind::Video
        && let Some(video) = task.file_path.as_deref().filter(|p| !p.is_empty())
    {
        let video = Path::new(video);
        paths.push(nfo::sidecar_path(video));
        paths.extend(nfo::artwork_paths(video));
    }
    let partials: Vec<PathBuf> = paths
        .iter()
        .map(|p| {
            let mut s = p.clone().into_os_string();
            s.push(".part");
            PathBuf::from(s)
        })
        .collect();
    paths.extend(partials);
    paths
}

/// Delete a task's files and any directories left empty below `root`.
pub async fn remove_task_files(task: &DownloadTask, root: &Path) -> CleanupReport {
    let mut report = CleanupReport::default();
    let mut parents = BTreeSet::new();

    for path in task_artifacts(task) {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "removed file");
                report.files_removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove file");
            }
        }
        if let Some(parent) = path.parent() {
            parents.insert(parent.to_path_buf());
        }
    }

    // Deepest first, so a work folder goes before its account folder.
    for dir in parents.into_iter().rev() {
        report.dirs_removed += prune_empty_dirs(&dir, root).await;
    }
    report
}

/// Remove `dir` and its ancestors while they are empty, never touching `root`
/// or anything outside it.
async fn prune_empty_dirs(dir: &Path, root: &Path) -> usize {
    let mut removed = 0;
    let mut current = Some(dir);
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // remove_dir fails on non-empty directories, which ends the walk.
        if tokio::fs::remove_dir(dir).await.is_err() {
            break;
        }
        tracing::debug!(dir = %dir.display(), "removed empty directory");
        removed += 1;
        current = dir.parent();
    }
    removed
}

/// Delete every task of the subscription's account, optionally with its
/// files, and reset the downloaded counter.
pub async fn clear_subscription(
    pool: &SqlitePool,
    cfg: &Config,
    subscription_id: &str,
    delete_files: bool,
) -> Result<CleanupReport> {
    let subscription = subscriptions::require(pool, subscription_id).await?;
    let mut report = CleanupReport::default();

    if delete_files {
        for task in tasks::list_for_account(pool, &subscription.account_id).await? {
            let removed = remove_task_files(&task, &cfg.download.download_dir).await;
            report.files_removed += removed.files_removed;
            report.dirs_removed += removed.dirs_removed;
        }
    }

    report.tasks_deleted = tasks::delete_for_account(pool, &subscription.account_id).await?;
    subscriptions::refresh_downloaded_count(pool, &subscription.account_id).await?;
    tracing::info!(
        subscription_id,
        account_id = %subscription.account_id,
        tasks = report.tasks_deleted,
        files = report.files_removed,
        "subscription cleared"
    );
    Ok(report)
}

/// Delete one task row and its files.
pub async fn delete_task(pool: &SqlitePool, cfg: &Config, task_id: &str) -> Result<CleanupReport> {
    let task = tasks::require(pool, task_id).await?;
    let mut report = remove_task_files(&task, &cfg.download.download_dir).await;
    if tasks::delete(pool, task_id).await? {
        report.tasks_deleted = 1;
    }
    subscriptions::refresh_downloaded_count(pool, &task.account_id).await?;
    tracing::info!(task_id, media_id = %task.media_id, files = report.files_removed, "task deleted");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_db;
    use crate::store::subscriptions::tests::subscription;
    use crate::store::tasks::tests::fields;

    async fn completed_task(
        pool: &SqlitePool,
        media_id: &str,
        kind: MediaKind,
        file_path: &Path,
        image_prefix: Option<&Path>,
        urls: usize,
    ) -> DownloadTask {
        let mut f = fields(kind, 1);
        f.all_download_urls = (1..=urls).map(|i| format!("https://cdn/{i}.png")).collect();
        let id = tasks::insert_new(pool, "acct", media_id, &f).await.unwrap().unwrap();
        tasks::claim(pool, &id).await.unwrap();
        tasks::complete(
            pool,
            &id,
            file_path.to_str().unwrap(),
            1,
            image_prefix.and_then(|p| p.to_str()),
        )
        .await
        .unwrap();
        tasks::require(pool, &id).await.unwrap()
    }

    fn config(root: &Path) -> Config {
        let mut cfg = Config::default();
        cfg.download.download_dir = root.to_path_buf();
        cfg
    }

    #[tokio::test]
    async fn image_set_siblings_and_empty_dirs_are_removed() {
        let root = tempfile::tempdir().unwrap();
        let work = root.path().join("alice_图集").join("2024_album");
        std::fs::create_dir_all(&work).unwrap();
        let prefix = work.join("album");
        for i in 1..=3 {
            std::fs::write(work.join(format!("album_{i}.png")), b"x").unwrap();
        }
        let pool = memory_db().await;
        let task = completed_task(
            &pool,
            "m1",
            MediaKind::ImageSet,
            &work.join("album_1.png"),
            Some(&prefix),
            3,
        )
        .await;

        let report = remove_task_files(&task, root.path()).await;
        assert_eq!(report.files_removed, 3);
        assert_eq!(report.dirs_removed, 2);
        assert!(root.path().exists());
        assert!(!root.path().join("alice_图集").exists());
    }

    #[tokio::test]
    async fn shared_account_folder_survives() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("alice");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.mp4"), b"a").unwrap();
        std::fs::write(dir.join("a.nfo"), b"<movie/>").unwrap();
        std::fs::write(dir.join("a-poster.jpg"), b"p").unwrap();
        std::fs::write(dir.join("b.mp4"), b"b").unwrap();

        let pool = memory_db().await;
        let task = completed_task(&pool, "m1", MediaKind::Video, &dir.join("a.mp4"), None, 1).await;
        let report = delete_task(&pool, &config(root.path()), &task.id).await.unwrap();

        assert_eq!(report.tasks_deleted, 1);
        assert_eq!(report.files_removed, 3);
        assert!(dir.join("b.mp4").exists());
        assert!(tasks::get(&pool, &task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_without_files_keeps_disk_and_resets_count() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("a.mp4");
        std::fs::write(&file, b"a").unwrap();

        let pool = memory_db().await;
        let sub = subscription("acct");
        subscriptions::insert(&pool, &sub).await.unwrap();
        completed_task(&pool, "m1", MediaKind::Video, &file, None, 1).await;
        subscriptions::refresh_downloaded_count(&pool, "acct").await.unwrap();

        let report = clear_subscription(&pool, &config(root.path()), &sub.id, false)
            .await
            .unwrap();
        assert_eq!(report.tasks_deleted, 1);
        assert_eq!(report.files_removed, 0);
        assert!(file.exists());
        let sub = subscriptions::require(&pool, &sub.id).await.unwrap();
        assert_eq!(sub.downloaded_count, 0);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let pool = memory_db().await;
        let err = delete_task(&pool, &config(root.path()), "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
