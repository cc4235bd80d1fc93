//! Media-server sidecar documents (`.nfo`) for downloaded videos.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};

use crate::config::NfoFormat;
use crate::model::DownloadTask;

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// `create_time` arrives as Unix seconds in text form; anything else is "now".
fn release_time(task: &DownloadTask) -> DateTime<Utc> {
    task.remote_create_time
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

fn runtime_minutes(duration: &str) -> i64 {
    let secs = duration.trim().parse::<f64>().unwrap_or(0.0);
    (secs / 60.0).round() as i64
}

/// Render the sidecar document, or `None` when sidecars are disabled.
pub fn render(task: &DownloadTask, format: NfoFormat) -> Option<String> {
    if format == NfoFormat::None {
        return None;
    }

    let title = if task.description.is_empty() {
        escape_xml(&format!("video_{}", task.media_id))
    } else {
        escape_xml(&task.description)
    };
    let author = if task.author_name.is_empty() {
        "unknown".to_string()
    } else {
        escape_xml(&task.author_name)
    };
    let released = release_time(task);
    let date = released.format("%Y-%m-%d").to_string();
    let year = released.year();
    let runtime = runtime_minutes(&task.duration);
    let likes = task.like_count.max(0);
    let rating = (likes as f64 / 10_000.0).min(10.0);
    let media_id = escape_xml(&task.media_id);

    let header = match format {
        NfoFormat::Plex => r#"<?xml version="1.0" encoding="UTF-8"?>"#,
        _ => r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    };

    let mut doc = String::new();
    let _ = writeln!(doc, "{header}");
    let _ = writeln!(doc, "<movie>");
    let _ = writeln!(doc, "  <title>{title}</title>");
    let _ = writeln!(doc, "  <originaltitle>{title}</originaltitle>");
    if format != NfoFormat::Plex {
        let _ = writeln!(doc, "  <sorttitle>{title}</sorttitle>");
    }
    let _ = writeln!(doc, "  <year>{year}</year>");
    let _ = writeln!(doc, "  <plot>{title}</plot>");
    let _ = writeln!(doc, "  <outline>{author} · {date}</outline>");
    let _ = writeln!(doc, "  <runtime>{runtime}</runtime>");
    if format != NfoFormat::Plex {
        let _ = writeln!(doc, "  <dateadded>{date}</dateadded>");
    }
    let _ = writeln!(doc, "  <premiered>{date}</premiered>");
    let _ = writeln!(doc, "  <releasedate>{date}</releasedate>");
    let _ = writeln!(doc, "  <genre>Short video</genre>");
    let _ = writeln!(doc, "  <studio>{author}</studio>");
    let _ = writeln!(doc, "  <director>{author}</director>");
    let _ = writeln!(doc, "  <actor>");
    let _ = writeln!(doc, "    <name>{author}</name>");
    let _ = writeln!(doc, "    <role>Creator</role>");
    if format == NfoFormat::Emby {
        let _ = writeln!(doc, "    <type>Actor</type>");
    }
    let _ = writeln!(doc, "  </actor>");

    match format {
        NfoFormat::Plex => {
            let _ = writeln!(doc, "  <rating>{}</rating>", rating.round() as i64);
            let _ = writeln!(doc, "  <votes>{likes}</votes>");
        }
        _ => {
            if format == NfoFormat::Emby {
                let _ = writeln!(doc, "  <id>{media_id}</id>");
            }
            let _ = writeln!(
                doc,
                r#"  <uniqueid type="douyin" default="true">{media_id}</uniqueid>"#
            );
            let _ = writeln!(doc, "  <ratings>");
            let _ = writeln!(doc, r#"    <rating name="likes" max="10" default="true">"#);
            let _ = writeln!(doc, "      <value>{rating}</value>");
            let _ = writeln!(doc, "      <votes>{likes}</votes>");
            let _ = writeln!(doc, "    </rating>");
            let _ = writeln!(doc, "  </ratings>");
            let _ = writeln!(
                doc,
                "  <criticrating>{}</criticrating>",
                (likes / 1000).min(100)
            );
        }
    }

    let _ = writeln!(doc, "  <tag>{author}</tag>");
    if format == NfoFormat::Jellyfin {
        let _ = writeln!(doc, "  <custominfo>");
        let _ = writeln!(doc, "    <video_id>{media_id}</video_id>");
        let _ = writeln!(
            doc,
            "    <author_uid>{}</author_uid>",
            escape_xml(&task.author_id)
        );
        let _ = writeln!(doc, "    <digg_count>{likes}</digg_count>");
        let _ = writeln!(
            doc,
            "    <comment_count>{}</comment_count>",
            task.comment_count
        );
        let _ = writeln!(doc, "    <share_count>{}</share_count>", task.share_count);
        let _ = writeln!(doc, "  </custominfo>");
    }
    let _ = writeln!(doc, "</movie>");

    Some(doc)
}

/// `clip.mp4` → `clip.nfo`
pub fn sidecar_path(video: &Path) -> PathBuf {
    video.with_extension("nfo")
}

/// Cover artwork copies media servers pick up next to `clip.mp4`:
/// `clip-poster.jpg`, `clip-fanart.jpg`, `clip-thumb.jpg`.
pub fn artwork_paths(video: &Path) -> Vec<PathBuf> {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = video.parent().unwrap_or_else(|| Path::new(""));
    ["poster", "fanart", "thumb"]
        .iter()
        .map(|kind| dir.join(format!("{stem}-{kind}.jpg")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MediaKind, TaskStatus};

    fn task() -> DownloadTask {
        DownloadTask {
            id: "t1".into(),
            media_id: "7300000000000000001".into(),
            account_id: "MS4w".into(),
            kind: MediaKind::Video,
            description: "Tom & Jerry <3".into(),
            author_name: "alice".into(),
            author_id: "1001".into(),
            cover_url: String::new(),
            primary_download_url: String::new(),
            all_download_urls: Vec::new(),
            duration: "125".into(),
            like_count: 25_000,
            comment_count: 12,
            share_count: 3,
            remote_create_time: "1700000000".into(),
            status: TaskStatus::Completed,
            progress: 100,
            error: None,
            file_path: None,
            file_size: 0,
            image_prefix: None,
            created_at: 0,
            completed_at: None,
        }
    }

    #[test]
    fn jellyfin_document_escapes_and_fills_fields() {
        let doc = render(&task(), NfoFormat::Jellyfin).unwrap();
        assert!(doc.contains("<title>Tom &amp; Jerry &lt;3</title>"));
        assert!(doc.contains("<premiered>2023-11-14</premiered>"));
        assert!(doc.contains("<runtime>2</runtime>"));
        assert!(doc.contains("<votes>25000</votes>"));
        assert!(doc.contains("<custominfo>"));
    }

    #[test]
    fn plex_document_is_reduced() {
        let doc = render(&task(), NfoFormat::Plex).unwrap();
        assert!(doc.contains("<rating>3</rating>"));
        assert!(!doc.contains("<uniqueid"));
        assert!(!doc.contains("<sorttitle>"));
    }

    #[test]
    fn emby_document_carries_id() {
        let doc = render(&task(), NfoFormat::Emby).unwrap();
        assert!(doc.contains("<id>7300000000000000001</id>"));
        assert!(doc.contains("<type>Actor</type>"));
    }

    #[test]
    fn disabled_format_renders_nothing() {
        assert!(render(&task(), NfoFormat::None).is_none());
    }

    #[test]
    fn sidecar_names_follow_video() {
        let video = Path::new("/media/alice/clip.mp4");
        assert_eq!(sidecar_path(video), PathBuf::from("/media/alice/clip.nfo"));
        let art = artwork_paths(video);
        assert_eq!(art[0], PathBuf::from("/media/alice/clip-poster.jpg"));
        assert_eq!(art[2], PathBuf::from("/media/alice/clip-thumb.jpg"));
    }
}
