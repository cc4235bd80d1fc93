use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::parse_column;
use crate::error::Result;
use crate::model::{RunStatus, SyncHistoryEntry, new_id, now_millis};

fn from_row(row: &SqliteRow) -> Result<SyncHistoryEntry> {
    Ok(SyncHistoryEntry {
        id: row.try_get("id")?,
        subscription_id: row.try_get("subscription_id")?,
        sync_time: row.try_get("sync_time")?,
        status: parse_column(row, "status")?,
        new_task_count: row.try_get("new_task_count")?,
        downloaded_count: row.try_get("downloaded_count")?,
        error: row.try_get("error")?,
    })
}

/// Append one sync attempt.
pub async fn record(
    pool: &SqlitePool,
    subscription_id: &str,
    status: RunStatus,
    new_task_count: i64,
    downloaded_count: i64,
    error: Option<&str>,
) -> Result<SyncHistoryEntry> {
    let entry = SyncHistoryEntry {
        id: new_id(),
        subscription_id: subscription_id.to_string(),
        sync_time: now_millis(),
        status,
        new_task_count,
        downloaded_count,
        error: error.map(str::to_string),
    };
    sqlx::query(
        r#"INSERT INTO sync_histories
            (id, subscription_id, sync_time, status, new_task_count, downloaded_count, error)
        VALUES (?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&entry.id)
    .bind(&entry.subscription_id)
    .bind(entry.sync_time)
    .bind(entry.status.as_str())
    .bind(entry.new_task_count)
    .bind(entry.downloaded_count)
    .bind(&entry.error)
    .execute(pool)
    .await?;
    Ok(entry)
}

/// Most recent first.
pub async fn list(
    pool: &SqlitePool,
    subscription_id: &str,
    limit: i64,
) -> Result<Vec<SyncHistoryEntry>> {
    let rows = sqlx::query(
        "SELECT * FROM sync_histories WHERE subscription_id = ? ORDER BY sync_time DESC, rowid DESC LIMIT ?",
    )
    .bind(subscription_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_db;
    use crate::store::subscriptions;

    #[tokio::test]
    async fn entries_cascade_with_subscription() {
        let pool = memory_db().await;
        let s = subscriptions::tests::subscription("acct");
        subscriptions::insert(&pool, &s).await.unwrap();
        record(&pool, &s.id, RunStatus::Success, 2, 1, None)
            .await
            .unwrap();
        record(&pool, &s.id, RunStatus::Failed, 0, 1, Some("timeout"))
            .await
            .unwrap();

        let entries = list(&pool, &s.id, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, RunStatus::Failed);
        assert_eq!(entries[0].error.as_deref(), Some("timeout"));

        subscriptions::delete(&pool, &s.id).await.unwrap();
        assert!(list(&pool, &s.id, 10).await.unwrap().is_empty());
    }
}
