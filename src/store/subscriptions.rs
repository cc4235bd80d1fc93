use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::parse_column;
use crate::error::{Error, Result};
use crate::model::{Millis, Subscription, TimeRange, now_millis};

impl Subscription {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            display_name: row.try_get("display_name")?,
            avatar_url: row.try_get("avatar_url")?,
            enabled: row.try_get("enabled")?,
            time_range: parse_column(row, "time_range")?,
            min_engagement: row.try_get("min_engagement")?,
            auto_download: row.try_get("auto_download")?,
            last_sync_time: row.try_get("last_sync_time")?,
            last_seen_media_id: row.try_get("last_seen_media_id")?,
            total_media_count: row.try_get("total_media_count")?,
            downloaded_count: row.try_get("downloaded_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// User-editable settings; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub enabled: Option<bool>,
    pub time_range: Option<TimeRange>,
    /// `Some(None)` clears the threshold.
    pub min_engagement: Option<Option<i64>>,
    pub auto_download: Option<bool>,
    pub display_name: Option<String>,
}

pub async fn insert(pool: &SqlitePool, s: &Subscription) -> Result<()> {
    let result = sqlx::query(
        r#"INSERT INTO subscriptions (
            id, account_id, display_name, avatar_url, enabled, time_range,
            min_engagement, auto_download, last_sync_time, last_seen_media_id,
            total_media_count, downloaded_count, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&s.id)
    .bind(&s.account_id)
    .bind(&s.display_name)
    .bind(&s.avatar_url)
    .bind(s.enabled)
    .bind(s.time_range.as_str())
    .bind(s.min_engagement)
    .bind(s.auto_download)
    .bind(s.last_sync_time)
    .bind(&s.last_seen_media_id)
    .bind(s.total_media_count)
    .bind(s.downloaded_count)
    .bind(s.created_at)
    .bind(s.updated_at)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(Error::Validation(
            format!("account {} is already subscribed", s.account_id),
        )),
        Err(e) => Err(e.into()),
    }
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<Subscription>> {
    let row = sqlx::query("SELECT * FROM subscriptions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(Subscription::from_row).transpose()
}

pub async fn require(pool: &SqlitePool, id: &str) -> Result<Subscription> {
    get(pool, id)
        .await?
        .ok_or_else(|| Error::subscription_not_found(id))
}

pub async fn get_by_account(pool: &SqlitePool, account_id: &str) -> Result<Option<Subscription>> {
    let row = sqlx::query("SELECT * FROM subscriptions WHERE account_id = ?")
        .bind(account_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(Subscription::from_row).transpose()
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<Subscription>> {
    let rows = sqlx::query("SELECT * FROM subscriptions ORDER BY created_at")
        .fetch_all(pool)
        .await?;
    rows.iter().map(Subscription::from_row).collect()
}

pub async fn list_enabled(pool: &SqlitePool) -> Result<Vec<Subscription>> {
    let rows = sqlx::query("SELECT * FROM subscriptions WHERE enabled = 1 ORDER BY created_at")
        .fetch_all(pool)
        .await?;
    rows.iter().map(Subscription::from_row).collect()
}

pub async fn update(pool: &SqlitePool, id: &str, u: &SubscriptionUpdate) -> Result<Subscription> {
    let mut s = require(pool, id).await?;
    if let Some(enabled) = u.enabled {
        s.enabled = enabled;
    }
    if let Some(range) = u.time_range {
        s.time_range = range;
    }
    if let Some(threshold) = u.min_engagement {
        s.min_engagement = threshold;
    }
    if let Some(auto) = u.auto_download {
        s.auto_download = auto;
    }
    if let Some(name) = &u.display_name {
        s.display_name = name.clone();
    }
    s.updated_at = now_millis();

    sqlx::query(
        r#"UPDATE subscriptions SET
            enabled = ?, time_range = ?, min_engagement = ?, auto_download = ?,
            display_name = ?, updated_at = ?
        WHERE id = ?"#,
    )
    .bind(s.enabled)
    .bind(s.time_range.as_str())
    .bind(s.min_engagement)
    .bind(s.auto_download)
    .bind(&s.display_name)
    .bind(s.updated_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(s)
}

/// Counters and timestamps written at the end of one sync cycle.
pub async fn record_sync(
    pool: &SqlitePool,
    id: &str,
    total_media_count: i64,
    last_seen_media_id: Option<&str>,
    synced_at: Millis,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE subscriptions SET
            total_media_count = ?,
            last_seen_media_id = COALESCE(?, last_seen_media_id),
            last_sync_time = ?,
            updated_at = ?
        WHERE id = ?"#,
    )
    .bind(total_media_count)
    .bind(last_seen_media_id)
    .bind(synced_at)
    .bind(synced_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Recompute `downloaded_count` from the completed rows of the account and
/// return the new value.
pub async fn refresh_downloaded_count(pool: &SqlitePool, account_id: &str) -> Result<i64> {
    sqlx::query(
        r#"UPDATE subscriptions SET downloaded_count = (
            SELECT COUNT(*) FROM download_tasks
            WHERE download_tasks.account_id = subscriptions.account_id
              AND download_tasks.status = 'completed'
        )
        WHERE account_id = ?"#,
    )
    .bind(account_id)
    .execute(pool)
    .await?;
    super::tasks::count_completed(pool, account_id).await
}

/// Overwrite the settings of an existing subscription from an imported record
/// (matched on `account_id`); runtime counters stay untouched.
pub async fn overwrite_settings(pool: &SqlitePool, s: &Subscription) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE subscriptions SET
            display_name = ?, avatar_url = ?, enabled = ?, time_range = ?,
            min_engagement = ?, auto_download = ?, updated_at = ?
        WHERE account_id = ?"#,
    )
    .bind(&s.display_name)
    .bind(&s.avatar_url)
    .bind(s.enabled)
    .bind(s.time_range.as_str())
    .bind(s.min_engagement)
    .bind(s.auto_download)
    .bind(now_millis())
    .bind(&s.account_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM subscriptions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::memory_db;
    use crate::model::new_id;

    pub(crate) fn subscription(account_id: &str) -> Subscription {
        let now = now_millis();
        Subscription {
            id: new_id(),
            account_id: account_id.into(),
            display_name: "alice".into(),
            avatar_url: None,
            enabled: true,
            time_range: TimeRange::LastMonth,
            min_engagement: None,
            auto_download: true,
            last_sync_time: None,
            last_seen_media_id: None,
            total_media_count: 0,
            downloaded_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn duplicate_account_is_rejected() {
        let pool = memory_db().await;
        insert(&pool, &subscription("acct")).await.unwrap();
        let err = insert(&pool, &subscription("acct")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn round_trips_all_fields() {
        let pool = memory_db().await;
        let mut s = subscription("acct");
        s.time_range = TimeRange::All;
        s.min_engagement = Some(100);
        s.auto_download = false;
        insert(&pool, &s).await.unwrap();
        assert_eq!(require(&pool, &s.id).await.unwrap(), s);
        assert_eq!(get_by_account(&pool, "acct").await.unwrap(), Some(s));
    }

    #[tokio::test]
    async fn partial_update_keeps_other_fields() {
        let pool = memory_db().await;
        let mut s = subscription("acct");
        s.min_engagement = Some(100);
        insert(&pool, &s).await.unwrap();

        let updated = update(
            &pool,
            &s.id,
            &SubscriptionUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.min_engagement, Some(100));

        let cleared = update(
            &pool,
            &s.id,
            &SubscriptionUpdate {
                min_engagement: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(cleared.min_engagement, None);
        assert!(list_enabled(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_unknown_is_not_found() {
        let pool = memory_db().await;
        let err = update(&pool, "nope", &SubscriptionUpdate::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn record_sync_keeps_last_seen_when_absent() {
        let pool = memory_db().await;
        let s = subscription("acct");
        insert(&pool, &s).await.unwrap();
        record_sync(&pool, &s.id, 5, Some("m9"), 1000).await.unwrap();
        record_sync(&pool, &s.id, 0, None, 2000).await.unwrap();
        let got = require(&pool, &s.id).await.unwrap();
        assert_eq!(got.total_media_count, 0);
        assert_eq!(got.last_seen_media_id.as_deref(), Some("m9"));
        assert_eq!(got.last_sync_time, Some(2000));
    }
}
