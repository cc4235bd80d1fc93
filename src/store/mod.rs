//! Metadata Sink: durable records for tasks, subscriptions, sync history and
//! schedule logs.

pub mod history;
pub mod schedule_logs;
pub mod subscriptions;
pub mod tasks;

use std::str::FromStr;

use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::error::{Error, Result};

/// Decode a text column through `FromStr`, reporting bad values as column
/// decode errors.
fn parse_column<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: String| {
        Error::Store(sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: e.into(),
        })
    })
}
