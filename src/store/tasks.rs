use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::parse_column;
use crate::error::{Error, Result};
use crate::fetcher::MediaItem;
use crate::model::{DownloadTask, MediaKind, TaskStatus, new_id, now_millis};

/// Remote-sourced fields of a task, refreshed on every sync.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFields {
    pub kind: MediaKind,
    pub description: String,
    pub author_name: String,
    pub author_id: String,
    pub cover_url: String,
    pub primary_download_url: String,
    pub all_download_urls: Vec<String>,
    pub duration: String,
    pub like_count: i64,
    pub comment_count: i64,
    pub share_count: i64,
    pub remote_create_time: String,
}

impl RemoteFields {
    pub fn from_item(item: &MediaItem) -> Self {
        Self {
            kind: item.kind,
            description: item.description.clone(),
            author_name: item.nickname.clone(),
            author_id: item.uid.clone(),
            cover_url: item.cover_url.clone(),
            primary_download_url: item.download_urls.first().cloned().unwrap_or_default(),
            all_download_urls: item.download_urls.clone(),
            duration: item.duration.clone(),
            like_count: item.like_count,
            comment_count: item.comment_count,
            share_count: item.share_count,
            remote_create_time: item.create_time.clone(),
        }
    }

    fn urls_json(&self) -> String {
        serde_json::to_string(&self.all_download_urls).unwrap_or_else(|_| "[]".into())
    }
}

impl DownloadTask {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let urls: String = row.try_get("all_download_urls")?;
        let all_download_urls = serde_json::from_str(&urls).map_err(|e| {
            Error::Store(sqlx::Error::ColumnDecode {
                index: "all_download_urls".to_string(),
                source: e.into(),
            })
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            media_id: row.try_get("media_id")?,
            account_id: row.try_get("account_id")?,
            kind: parse_column(row, "kind")?,
            description: row.try_get("description")?,
            author_name: row.try_get("author_name")?,
            author_id: row.try_get("author_id")?,
            cover_url: row.try_get("cover_url")?,
            primary_download_url: row.try_get("primary_download_url")?,
            all_download_urls,
            duration: row.try_get("duration")?,
            like_count: row.try_get("like_count")?,
            comment_count: row.try_get("comment_count")?,
            share_count: row.try_get("share_count")?,
            remote_create_time: row.try_get("remote_create_time")?,
            status: parse_column(row, "status")?,
            progress: row.try_get("progress")?,
            error: row.try_get("error")?,
            file_path: row.try_get("file_path")?,
            file_size: row.try_get("file_size")?,
            image_prefix: row.try_get("image_prefix")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

fn collect(rows: &[SqliteRow]) -> Result<Vec<DownloadTask>> {
    rows.iter().map(DownloadTask::from_row).collect()
}

/// Insert a freshly discovered item as `pending`. Returns the new task id, or
/// `None` when the media id is already tracked.
pub async fn insert_new(
    pool: &SqlitePool,
    account_id: &str,
    media_id: &str,
    fields: &RemoteFields,
) -> Result<Option<String>> {
    let id = new_id();
    let result = sqlx::query(
        r#"INSERT INTO download_tasks (
            id, media_id, account_id, kind, description, author_name, author_id,
            cover_url, primary_download_url, all_download_urls, duration,
            like_count, comment_count, share_count, remote_create_time,
            status, progress, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?)
        ON CONFLICT(media_id) DO NOTHING"#,
    )
    .bind(&id)
    .bind(media_id)
    .bind(account_id)
    .bind(fields.kind.as_str())
    .bind(&fields.description)
    .bind(&fields.author_name)
    .bind(&fields.author_id)
    .bind(&fields.cover_url)
    .bind(&fields.primary_download_url)
    .bind(fields.urls_json())
    .bind(&fields.duration)
    .bind(fields.like_count)
    .bind(fields.comment_count)
    .bind(fields.share_count)
    .bind(&fields.remote_create_time)
    .bind(now_millis())
    .execute(pool)
    .await?;

    Ok((result.rows_affected() == 1).then_some(id))
}

/// Merge volatile remote fields into an existing row. Writes only when a value
/// differs and never touches a row that is `downloading`. Returns whether the
/// row changed.
pub async fn refresh_metadata(
    pool: &SqlitePool,
    media_id: &str,
    fields: &RemoteFields,
) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE download_tasks SET
            kind = ?1, description = ?2, author_name = ?3, author_id = ?4,
            cover_url = ?5, primary_download_url = ?6, all_download_urls = ?7,
            duration = ?8, like_count = ?9, comment_count = ?10, share_count = ?11,
            remote_create_time = ?12
        WHERE media_id = ?13
          AND status <> 'downloading'
          AND (kind IS NOT ?1 OR description IS NOT ?2 OR author_name IS NOT ?3
               OR author_id IS NOT ?4 OR cover_url IS NOT ?5
               OR primary_download_url IS NOT ?6 OR all_download_urls IS NOT ?7
               OR duration IS NOT ?8 OR like_count IS NOT ?9
               OR comment_count IS NOT ?10 OR share_count IS NOT ?11
               OR remote_create_time IS NOT ?12)"#,
    )
    .bind(fields.kind.as_str())
    .bind(&fields.description)
    .bind(&fields.author_name)
    .bind(&fields.author_id)
    .bind(&fields.cover_url)
    .bind(&fields.primary_download_url)
    .bind(fields.urls_json())
    .bind(&fields.duration)
    .bind(fields.like_count)
    .bind(fields.comment_count)
    .bind(fields.share_count)
    .bind(&fields.remote_create_time)
    .bind(media_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Transition into `downloading` unless already there: clears error and file
/// fields, progress back to 0. Returns `false` if another caller holds it.
pub async fn claim(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE download_tasks
        SET status = 'downloading', progress = 0, error = NULL,
            file_path = NULL, file_size = 0, image_prefix = NULL, completed_at = NULL
        WHERE id = ? AND status <> 'downloading'"#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `false` means the task is no longer `downloading`.
pub async fn update_progress(pool: &SqlitePool, id: &str, progress: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE download_tasks SET progress = ? WHERE id = ? AND status = 'downloading'",
    )
    .bind(progress.clamp(0, 100))
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn complete(
    pool: &SqlitePool,
    id: &str,
    file_path: &str,
    file_size: i64,
    image_prefix: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE download_tasks
        SET status = 'completed', progress = 100, error = NULL,
            file_path = ?, file_size = ?, image_prefix = ?, completed_at = ?
        WHERE id = ? AND status = 'downloading'"#,
    )
    .bind(file_path)
    .bind(file_size)
    .bind(image_prefix)
    .bind(now_millis())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn fail(pool: &SqlitePool, id: &str, error: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE download_tasks SET status = 'failed', error = ? WHERE id = ? AND status = 'downloading'",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Explicit stop: `downloading → pending`, nothing else changes.
pub async fn stop(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE download_tasks SET status = 'pending' WHERE id = ? AND status = 'downloading'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Return rows left `downloading` by a previous process to `pending`.
pub async fn reset_stale(pool: &SqlitePool) -> Result<u64> {
    let result =
        sqlx::query("UPDATE download_tasks SET status = 'pending' WHERE status = 'downloading'")
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<DownloadTask>> {
    let row = sqlx::query("SELECT * FROM download_tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(DownloadTask::from_row).transpose()
}

pub async fn require(pool: &SqlitePool, id: &str) -> Result<DownloadTask> {
    get(pool, id)
        .await?
        .ok_or_else(|| Error::task_not_found(id))
}

pub async fn get_by_media_id(pool: &SqlitePool, media_id: &str) -> Result<Option<DownloadTask>> {
    let row = sqlx::query("SELECT * FROM download_tasks WHERE media_id = ?")
        .bind(media_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(DownloadTask::from_row).transpose()
}

pub async fn list_for_account(pool: &SqlitePool, account_id: &str) -> Result<Vec<DownloadTask>> {
    let rows = sqlx::query("SELECT * FROM download_tasks WHERE account_id = ? ORDER BY created_at")
        .bind(account_id)
        .fetch_all(pool)
        .await?;
    collect(&rows)
}

pub async fn list_completed_for_account(
    pool: &SqlitePool,
    account_id: &str,
) -> Result<Vec<DownloadTask>> {
    let rows = sqlx::query(
        "SELECT * FROM download_tasks WHERE account_id = ? AND status = 'completed' ORDER BY created_at",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;
    collect(&rows)
}

pub async fn list_completed(pool: &SqlitePool) -> Result<Vec<DownloadTask>> {
    let rows = sqlx::query("SELECT * FROM download_tasks WHERE status = 'completed'")
        .fetch_all(pool)
        .await?;
    collect(&rows)
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub account_id: Option<String>,
    /// Substring match on the author's display name.
    pub author: Option<String>,
    pub limit: Option<i64>,
}

/// Newest first.
pub async fn list(pool: &SqlitePool, filter: &TaskFilter) -> Result<Vec<DownloadTask>> {
    let rows = sqlx::query(
        r#"SELECT * FROM download_tasks
        WHERE (?1 IS NULL OR status = ?1)
          AND (?2 IS NULL OR account_id = ?2)
          AND (?3 IS NULL OR instr(author_name, ?3) > 0)
        ORDER BY created_at DESC
        LIMIT ?4"#,
    )
    .bind(filter.status.map(TaskStatus::as_str))
    .bind(filter.account_id.as_deref())
    .bind(filter.author.as_deref())
    .bind(filter.limit.unwrap_or(-1))
    .fetch_all(pool)
    .await?;
    collect(&rows)
}

pub async fn ids_with_status(pool: &SqlitePool, status: TaskStatus) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT id FROM download_tasks WHERE status = ? ORDER BY created_at")
        .bind(status.as_str())
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| r.try_get::<String, _>("id").map_err(Error::from))
        .collect()
}

pub async fn count_completed(pool: &SqlitePool, account_id: &str) -> Result<i64> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM download_tasks WHERE account_id = ? AND status = 'completed'",
    )
    .bind(account_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Task counts per status, for the status summary.
pub async fn count_by_status(pool: &SqlitePool) -> Result<Vec<(TaskStatus, i64)>> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM download_tasks GROUP BY status")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| -> Result<(TaskStatus, i64)> { Ok((parse_column(r, "status")?, r.try_get("n")?)) })
        .collect()
}

pub async fn set_file_size(pool: &SqlitePool, id: &str, file_size: i64) -> Result<()> {
    sqlx::query("UPDATE download_tasks SET file_size = ? WHERE id = ?")
        .bind(file_size)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// `completed → deleted` for the task whose canonical file is `file_path`.
pub async fn mark_deleted_by_path(pool: &SqlitePool, file_path: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE download_tasks SET status = 'deleted' WHERE file_path = ? AND status = 'completed'",
    )
    .bind(file_path)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn mark_deleted(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE download_tasks SET status = 'deleted' WHERE id = ? AND status = 'completed'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM download_tasks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete_for_account(pool: &SqlitePool, account_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM download_tasks WHERE account_id = ?")
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::memory_db;

    pub(crate) fn fields(kind: MediaKind, likes: i64) -> RemoteFields {
        RemoteFields {
            kind,
            description: "first post".into(),
            author_name: "alice".into(),
            author_id: "1001".into(),
            cover_url: "https://cdn/cover.jpg".into(),
            primary_download_url: "https://cdn/a.mp4".into(),
            all_download_urls: vec!["https://cdn/a.mp4".into()],
            duration: "15".into(),
            like_count: likes,
            comment_count: 1,
            share_count: 0,
            remote_create_time: "1700000000".into(),
        }
    }

    #[tokio::test]
    async fn insert_is_unique_per_media_id() {
        let pool = memory_db().await;
        let f = fields(MediaKind::Video, 10);
        let first = insert_new(&pool, "acct", "m1", &f).await.unwrap();
        let second = insert_new(&pool, "acct", "m1", &f).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(list_for_account(&pool, "acct").await.unwrap().len(), 1);

        let task = get_by_media_id(&pool, "m1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.all_download_urls, vec!["https://cdn/a.mp4"]);
    }

    #[tokio::test]
    async fn refresh_writes_only_on_change() {
        let pool = memory_db().await;
        let f = fields(MediaKind::Video, 10);
        insert_new(&pool, "acct", "m1", &f).await.unwrap();
        assert!(!refresh_metadata(&pool, "m1", &f).await.unwrap());

        let bumped = fields(MediaKind::Video, 11);
        assert!(refresh_metadata(&pool, "m1", &bumped).await.unwrap());
        let task = get_by_media_id(&pool, "m1").await.unwrap().unwrap();
        assert_eq!(task.like_count, 11);
    }

    #[tokio::test]
    async fn refresh_skips_downloading_rows() {
        let pool = memory_db().await;
        let id = insert_new(&pool, "acct", "m1", &fields(MediaKind::Video, 10))
            .await
            .unwrap()
            .unwrap();
        assert!(claim(&pool, &id).await.unwrap());
        assert!(
            !refresh_metadata(&pool, "m1", &fields(MediaKind::Video, 99))
                .await
                .unwrap()
        );
        assert_eq!(require(&pool, &id).await.unwrap().like_count, 10);
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_clears_file_fields() {
        let pool = memory_db().await;
        let id = insert_new(&pool, "acct", "m1", &fields(MediaKind::Video, 10))
            .await
            .unwrap()
            .unwrap();
        assert!(claim(&pool, &id).await.unwrap());
        assert!(!claim(&pool, &id).await.unwrap());

        assert!(complete(&pool, &id, "/d/a.mp4", 42, None).await.unwrap());
        let done = require(&pool, &id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.file_path.as_deref(), Some("/d/a.mp4"));
        assert!(done.completed_at.is_some());

        assert!(claim(&pool, &id).await.unwrap());
        let reset = require(&pool, &id).await.unwrap();
        assert_eq!(reset.status, TaskStatus::Downloading);
        assert_eq!(reset.progress, 0);
        assert!(reset.file_path.is_none());
        assert!(reset.completed_at.is_none());
    }

    #[tokio::test]
    async fn writes_after_stop_are_rejected() {
        let pool = memory_db().await;
        let id = insert_new(&pool, "acct", "m1", &fields(MediaKind::Video, 10))
            .await
            .unwrap()
            .unwrap();
        claim(&pool, &id).await.unwrap();
        assert!(update_progress(&pool, &id, 40).await.unwrap());
        assert!(stop(&pool, &id).await.unwrap());

        assert!(!update_progress(&pool, &id, 60).await.unwrap());
        assert!(!complete(&pool, &id, "/d/a.mp4", 1, None).await.unwrap());
        assert!(!fail(&pool, &id, "late").await.unwrap());

        let task = require(&pool, &id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 40);
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn stale_downloads_return_to_pending() {
        let pool = memory_db().await;
        let id = insert_new(&pool, "acct", "m1", &fields(MediaKind::Video, 10))
            .await
            .unwrap()
            .unwrap();
        claim(&pool, &id).await.unwrap();
        assert_eq!(reset_stale(&pool).await.unwrap(), 1);
        assert_eq!(require(&pool, &id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn filter_by_status_and_author() {
        let pool = memory_db().await;
        let mut f = fields(MediaKind::Video, 10);
        insert_new(&pool, "acct", "m1", &f).await.unwrap();
        f.author_name = "bob".into();
        let bob = insert_new(&pool, "acct2", "m2", &f).await.unwrap().unwrap();
        claim(&pool, &bob).await.unwrap();

        let downloading = list(
            &pool,
            &TaskFilter {
                status: Some(TaskStatus::Downloading),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(downloading.len(), 1);
        assert_eq!(downloading[0].id, bob);

        let alices = list(
            &pool,
            &TaskFilter {
                author: Some("ali".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(alices.len(), 1);
        assert_eq!(alices[0].media_id, "m1");
        assert_eq!(list(&pool, &TaskFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deletion_by_path_only_touches_completed() {
        let pool = memory_db().await;
        let id = insert_new(&pool, "acct", "m1", &fields(MediaKind::Video, 10))
            .await
            .unwrap()
            .unwrap();
        claim(&pool, &id).await.unwrap();
        assert_eq!(mark_deleted_by_path(&pool, "/d/a.mp4").await.unwrap(), 0);
        complete(&pool, &id, "/d/a.mp4", 1, None).await.unwrap();
        assert_eq!(mark_deleted_by_path(&pool, "/d/a.mp4").await.unwrap(), 1);
        assert_eq!(require(&pool, &id).await.unwrap().status, TaskStatus::Deleted);
    }

    #[tokio::test]
    async fn completed_count_per_account() {
        let pool = memory_db().await;
        let f = fields(MediaKind::Video, 10);
        let a = insert_new(&pool, "acct", "m1", &f).await.unwrap().unwrap();
        insert_new(&pool, "acct", "m2", &f).await.unwrap();
        claim(&pool, &a).await.unwrap();
        complete(&pool, &a, "/d/a.mp4", 1, None).await.unwrap();
        assert_eq!(count_completed(&pool, "acct").await.unwrap(), 1);
        assert_eq!(count_completed(&pool, "other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_url_list_is_a_store_error() {
        let pool = memory_db().await;
        let id = insert_new(&pool, "acct", "m1", &fields(MediaKind::ImageSet, 10))
            .await
            .unwrap()
            .unwrap();
        sqlx::query("UPDATE download_tasks SET all_download_urls = 'u1,u2' WHERE id = ?")
            .bind(&id)
            .execute(&pool)
            .await
            .unwrap();

        let err = get(&pool, &id).await.unwrap_err();
        assert!(matches!(err, Error::Store(sqlx::Error::ColumnDecode { .. })));
        assert!(list_for_account(&pool, "acct").await.is_err());
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let pool = memory_db().await;
        assert!(require(&pool, "nope").await.unwrap_err().is_not_found());
    }
}
