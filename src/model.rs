use std::fmt;
use std::str::FromStr;

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Millis = i64;

pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle of a tracked media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    /// The file was removed out-of-band; no automated transition leaves this state.
    Deleted,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "downloading" => Ok(TaskStatus::Downloading),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "deleted" => Ok(TaskStatus::Deleted),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    ImageSet,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::ImageSet => "image_set",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(MediaKind::Video),
            "image_set" => Ok(MediaKind::ImageSet),
            other => Err(format!("unknown media kind '{other}'")),
        }
    }
}

/// How far back a subscription looks when asking the media API for posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "all")]
    All,
    #[serde(rename = "six-months")]
    LastSixMonths,
    #[default]
    #[serde(rename = "one-month")]
    LastMonth,
}

impl TimeRange {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeRange::All => "all",
            TimeRange::LastSixMonths => "six-months",
            TimeRange::LastMonth => "one-month",
        }
    }

    /// Inclusive `(earliest, latest)` dates relative to `today`, or `None` for
    /// an unbounded query. Month arithmetic clamps to the end of shorter months.
    pub fn date_range(self, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
        let months = match self {
            TimeRange::All => return None,
            TimeRange::LastMonth => 1,
            TimeRange::LastSixMonths => 6,
        };
        let earliest = today
            .checked_sub_months(Months::new(months))
            .unwrap_or(NaiveDate::MIN);
        Some((earliest, today))
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(TimeRange::All),
            "six-months" | "half-year" => Ok(TimeRange::LastSixMonths),
            "one-month" | "month" => Ok(TimeRange::LastMonth),
            other => Err(format!(
                "unknown time range '{other}' (expected all, six-months or one-month)"
            )),
        }
    }
}

/// One tracked remote media item and its download lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadTask {
    pub id: String,
    pub media_id: String,
    pub account_id: String,
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
    pub status: TaskStatus,
    pub progress: i64,
    pub error: Option<String>,
    /// Video file, or the first image of an image set.
    pub file_path: Option<String>,
    pub file_size: i64,
    /// Directory plus shared filename prefix of an image set's files.
    pub image_prefix: Option<String>,
    pub created_at: Millis,
    pub completed_at: Option<Millis>,
}

impl DownloadTask {
    pub fn expected_file_count(&self) -> usize {
        match self.kind {
            MediaKind::Video => 1,
            MediaKind::ImageSet => self.all_download_urls.len().max(1),
        }
    }
}

/// A followed remote account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub account_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub enabled: bool,
    pub time_range: TimeRange,
    pub min_engagement: Option<i64>,
    pub auto_download: bool,
    pub last_sync_time: Option<Millis>,
    pub last_seen_media_id: Option<String>,
    pub total_media_count: i64,
    pub downloaded_count: i64,
    pub created_at: Millis,
    pub updated_at: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Append-only record of one sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncHistoryEntry {
    pub id: String,
    pub subscription_id: String,
    pub sync_time: Millis,
    pub status: RunStatus,
    pub new_task_count: i64,
    pub downloaded_count: i64,
    pub error: Option<String>,
}

/// One scheduler tick's outcome for one subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleLog {
    pub id: String,
    pub start_time: Millis,
    pub end_time: Millis,
    pub status: RunStatus,
    pub message: String,
    pub details: serde_json::Value,
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Downloading,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn all_time_range_is_unbounded() {
        assert_eq!(TimeRange::All.date_range(date(2025, 3, 10)), None);
    }

    #[test]
    fn one_month_range() {
        let (from, to) = TimeRange::LastMonth.date_range(date(2025, 3, 10)).unwrap();
        assert_eq!(from, date(2025, 2, 10));
        assert_eq!(to, date(2025, 3, 10));
    }

    #[test]
    fn month_arithmetic_clamps_to_month_end() {
        let (from, _) = TimeRange::LastMonth.date_range(date(2025, 3, 31)).unwrap();
        assert_eq!(from, date(2025, 2, 28));
        let (from, _) = TimeRange::LastSixMonths
            .date_range(date(2025, 8, 31))
            .unwrap();
        assert_eq!(from, date(2025, 2, 28));
    }

    #[test]
    fn time_range_accepts_aliases() {
        assert_eq!("month".parse::<TimeRange>().unwrap(), TimeRange::LastMonth);
        assert_eq!(
            "half-year".parse::<TimeRange>().unwrap(),
            TimeRange::LastSixMonths
        );
        assert!("forever".parse::<TimeRange>().is_err());
    }

    #[test]
    fn image_set_expects_one_file_per_url() {
        let mut task = sample_task();
        task.kind = MediaKind::ImageSet;
        task.all_download_urls = vec!["u1".into(), "u2".into(), "u3".into()];
        assert_eq!(task.expected_file_count(), 3);
        task.kind = MediaKind::Video;
        assert_eq!(task.expected_file_count(), 1);
    }

    fn sample_task() -> DownloadTask {
        DownloadTask {
            id: "t1".into(),
            media_id: "m1".into(),
            account_id: "acct".into(),
            kind: MediaKind::Video,
            description: String::new(),
            author_name: String::new(),
            author_id: String::new(),
            cover_url: String::new(),
            primary_download_url: String::new(),
            all_download_urls: Vec::new(),
            duration: String::new(),
            like_count: 0,
            comment_count: 0,
            share_count: 0,
            remote_create_time: String::new(),
            status: TaskStatus::Pending,
            progress: 0,
            error: None,
            file_path: None,
            file_size: 0,
            image_prefix: None,
            created_at: 0,
            completed_at: None,
        }
    }
}
