use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::fetcher::MediaItem;
use crate::model::{DownloadTask, MediaKind, TaskStatus};
use crate::naming::image_extension;

/// `{prefix}_{n}.{ext}` as written for image-set members.
static INDEXED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)_\d+\.(\w+)$").expect("static regex"));

/// What the sync engine should do with one fetched item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    /// First sighting of this media id.
    Create { media_id: String },
    /// Existing task goes back to `downloading` from scratch.
    Redownload {
        task_id: String,
        media_id: String,
        reason: RedownloadReason,
    },
    /// Leave the task's status alone (metadata may still be refreshed).
    Skip { media_id: String, reason: SkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedownloadReason {
    /// Completed, but one or more expected files are gone.
    FilesMissing,
    /// Pending or failed from an earlier cycle.
    Unfinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A transfer is in flight; the row must not be touched.
    Active,
    /// Completed and every expected file is on disk.
    Present,
    /// Removed out-of-band; stays that way.
    Deleted,
}

impl TaskAction {
    pub fn media_id(&self) -> &str {
        match self {
            TaskAction::Create { media_id }
            | TaskAction::Redownload { media_id, .. }
            | TaskAction::Skip { media_id, .. } => media_id,
        }
    }
}

/// Drop items below the engagement threshold. `None` or a non-positive
/// threshold keeps everything.
pub fn filter_by_engagement(items: &[MediaItem], min_engagement: Option<i64>) -> Vec<MediaItem> {
    match min_engagement {
        Some(min) if min > 0 => items
            .iter()
            .filter(|item| item.like_count >= min)
            .cloned()
            .collect(),
        _ => items.to_vec(),
    }
}

/// Paths that must all exist for a completed task to count as present.
///
/// Image sets prefer the recorded `image_prefix`; older rows without one fall
/// back to recovering the prefix from `file_path`, and finally to `file_path`
/// alone.
pub fn expected_files(task: &DownloadTask) -> Vec<PathBuf> {
    let Some(file_path) = task.file_path.as_deref().filter(|p| !p.is_empty()) else {
        return Vec::new();
    };

    if task.kind == MediaKind::Video {
        return vec![PathBuf::from(file_path)];
    }

    let count = task.expected_file_count();

    if let Some(prefix) = task.image_prefix.as_deref().filter(|p| !p.is_empty()) {
        return (1..=count)
            .map(|i| {
                let ext = task
                    .all_download_urls
                    .get(i - 1)
                    .map(|url| image_extension(url))
                    .unwrap_or_else(|| "jpg".to_string());
                PathBuf::from(format!("{prefix}_{i}.{ext}"))
            })
            .collect();
    }

    let path = Path::new(file_path);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match INDEXED_NAME.captures(&file_name) {
        Some(caps) => {
            let dir = path.parent().unwrap_or_else(|| Path::new(""));
            (1..=count)
                .map(|i| dir.join(format!("{}_{i}.{}", &caps[1], &caps[2])))
                .collect()
        }
        None => vec![PathBuf::from(file_path)],
    }
}

/// `true` when every expected file of a completed task exists.
pub fn files_present(task: &DownloadTask, exists: &impl Fn(&Path) -> bool) -> bool {
    let expected = expected_files(task);
    !expected.is_empty() && expected.iter().all(|p| exists(p.as_path()))
}

/// Decide the action for one fetched item given its existing task, if any.
pub fn reconcile_item(
    item: &MediaItem,
    existing: Option<&DownloadTask>,
    exists: &impl Fn(&Path) -> bool,
) -> TaskAction {
    let media_id = item.id.clone();
    let Some(task) = existing else {
        return TaskAction::Create { media_id };
    };

    match task.status {
        TaskStatus::Downloading => TaskAction::Skip {
            media_id,
            reason: SkipReason::Active,
        },
        TaskStatus::Deleted => TaskAction::Skip {
            media_id,
            reason: SkipReason::Deleted,
        },
        TaskStatus::Completed if files_present(task, exists) => TaskAction::Skip {
            media_id,
            reason: SkipReason::Present,
        },
        TaskStatus::Completed => TaskAction::Redownload {
            task_id: task.id.clone(),
            media_id,
            reason: RedownloadReason::FilesMissing,
        },
        TaskStatus::Pending | TaskStatus::Failed => TaskAction::Redownload {
            task_id: task.id.clone(),
            media_id,
            reason: RedownloadReason::Unfinished,
        },
    }
}

/// Run reconciliation over the filtered fetch.
///
/// `items` arrive newest first; actions come back oldest first so downloads are
/// dispatched in publication order. Duplicate ids in one fetch collapse to
/// their first (oldest) occurrence.
pub fn reconcile(
    items: &[MediaItem],
    existing: &HashMap<String, DownloadTask>,
    exists: &impl Fn(&Path) -> bool,
) -> Vec<TaskAction> {
    let mut seen = HashSet::new();
    items
        .iter()
        .rev()
        .filter(|item| seen.insert(item.id.as_str()))
        .map(|item| reconcile_item(item, existing.get(&item.id), exists))
        .collect()
}

/// Outcome of the independent pass over already-completed tasks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MissingFiles {
    /// Files gone and the item is still listed remotely: redownload.
    pub requeue: Vec<String>,
    /// Files gone and the item is no longer listed: flagged only.
    pub dangling: Vec<String>,
}

/// Check every completed task of the account, regardless of the engagement
/// filter. `listed` holds the media ids of the unfiltered fetch; tasks in
/// `handled` were already dealt with by [`reconcile`].
pub fn missing_file_pass(
    completed: &[DownloadTask],
    listed: &HashSet<&str>,
    handled: &HashSet<&str>,
    exists: &impl Fn(&Path) -> bool,
) -> MissingFiles {
    let mut out = MissingFiles::default();
    for task in completed {
        if task.status != TaskStatus::Completed
            || handled.contains(task.id.as_str())
            || files_present(task, exists)
        {
            continue;
        }
        if listed.contains(task.media_id.as_str()) {
            out.requeue.push(task.id.clone());
        } else {
            out.dangling.push(task.id.clone());
        }
    }
    out
}
