//! Template-driven folder and file naming.
//!
//! Templates use `{key}` placeholders. Known keys: `uid`, `nickname`, `mark`,
//! `type`, `id`, `desc`, `create_time`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::config::DownloadConfig;
use crate::model::DownloadTask;

const MAX_SEGMENT_CHARS: usize = 200;
const FALLBACK_NAME: &str = "unnamed";

/// Label substituted for `{type}`; every synced post comes from the account's
/// published list.
const POST_TYPE_LABEL: &str = "发布作品";

pub const VIDEO_EXTENSION: &str = "mp4";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^}]+\}").expect("static regex"));
static UNDERSCORE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_{2,}").expect("static regex"));
static DASH_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").expect("static regex"));
static IMAGE_EXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(jpg|jpeg|png|webp|gif)").expect("static regex"));

/// Image file extension guessed from a CDN URL, `jpg` when nothing matches.
pub fn image_extension(url: &str) -> String {
    IMAGE_EXT
        .captures(url)
        .map(|c| c[1].to_ascii_lowercase())
        .unwrap_or_else(|| "jpg".to_string())
}

/// Replace path-illegal characters, collapse whitespace and bound the length.
pub fn sanitize(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '%' | '*' | ':' | '|' | '"' | '<' | '>' | '\n' | '\r' | '\t' => '_',
            c => c,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_SEGMENT_CHARS).collect()
}

/// Render `template` into a single filesystem-safe path segment.
///
/// Never fails: unknown placeholders are dropped, separator runs collapsed,
/// and an empty result becomes `"unnamed"`.
pub fn format(template: &str, params: &HashMap<&str, String>) -> String {
    let substituted = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        let key = &caps[0][1..caps[0].len() - 1];
        params.get(key).map(|v| sanitize(v)).unwrap_or_default()
    });

    let collapsed = UNDERSCORE_RUN.replace_all(&substituted, "_");
    let collapsed = DASH_RUN.replace_all(collapsed.trim_matches('_'), "-");
    let result = sanitize(collapsed.trim_matches('-'));

    if result.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        result
    }
}

/// Template parameters for one task.
pub fn task_params(task: &DownloadTask, mark: &str) -> HashMap<&'static str, String> {
    let fallback_desc = match task.kind {
        crate::model::MediaKind::Video => "video",
        crate::model::MediaKind::ImageSet => "image_album",
    };
    let uid = if !task.account_id.is_empty() {
        task.account_id.clone()
    } else if !task.author_id.is_empty() {
        task.author_id.clone()
    } else {
        "unknown".to_string()
    };
    let nickname = if task.author_name.is_empty() {
        "unknown".to_string()
    } else {
        task.author_name.clone()
    };
    let desc = if task.description.is_empty() {
        fallback_desc.to_string()
    } else {
        task.description.clone()
    };

    HashMap::from([
        ("uid", uid),
        ("nickname", nickname),
        ("mark", mark.to_string()),
        ("type", POST_TYPE_LABEL.to_string()),
        ("id", task.media_id.clone()),
        ("desc", desc),
        ("create_time", task.remote_create_time.clone()),
    ])
}

/// Where a task's files live and what they are called (without extension).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLayout {
    pub dir: PathBuf,
    pub file_stem: String,
}

impl TargetLayout {
    pub fn file(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", self.file_stem))
    }

    /// `{stem}_{index}.{ext}`, 1-based, for image-set members.
    pub fn indexed_file(&self, index: usize, ext: &str) -> PathBuf {
        self.dir.join(format!("{}_{index}.{ext}", self.file_stem))
    }

    /// Directory joined with the shared image prefix.
    pub fn prefix(&self) -> PathBuf {
        self.dir.join(&self.file_stem)
    }
}

/// `{download_dir}/{account_folder}/[{work_folder}/]` plus the file stem.
pub fn resolve_layout(download_dir: &Path, cfg: &DownloadConfig, task: &DownloadTask) -> TargetLayout {
    let params = task_params(task, &cfg.mark);
    let mut dir = download_dir.join(format(&cfg.folder_name_format, &params));
    if !cfg.work_folder_name_format.trim().is_empty() {
        dir = dir.join(format(&cfg.work_folder_name_format, &params));
    }
    TargetLayout {
        dir,
        file_stem: format(&cfg.file_name_format, &params),
    }
}
