use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::parse_column;
use crate::error::Result;
use crate::model::ScheduleLog;

fn from_row(row: &SqliteRow) -> Result<ScheduleLog> {
    let details: String = row.try_get("details")?;
    Ok(ScheduleLog {
        id: row.try_get("id")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        status: parse_column(row, "status")?,
        message: row.try_get("message")?,
        details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
    })
}

pub async fn insert(pool: &SqlitePool, log: &ScheduleLog) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO schedule_logs (id, start_time, end_time, status, message, details)
        VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&log.id)
    .bind(log.start_time)
    .bind(log.end_time)
    .bind(log.status.as_str())
    .bind(&log.message)
    .bind(log.details.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<ScheduleLog>> {
    let rows =
        sqlx::query("SELECT * FROM schedule_logs ORDER BY start_time DESC, rowid DESC LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await?;
    rows.iter().map(from_row).collect()
}
