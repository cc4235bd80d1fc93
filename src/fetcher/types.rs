use serde::Deserialize;
use serde_json::Value;

use super::{FetchResponse, MediaItem};
use crate::model::MediaKind;

/// Body of `POST /douyin/account`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Vec<RawMediaItem>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMediaItem {
    #[serde(default)]
    pub id: Value,
    #[serde(rename = "type", default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub uid: Value,
    #[serde(default)]
    pub static_cover: Option<String>,
    #[serde(default)]
    pub dynamic_cover: Option<String>,
    #[serde(default)]
    pub downloads: Option<RawDownloads>,
    #[serde(default)]
    pub duration: Value,
    #[serde(default)]
    pub digg_count: Value,
    #[serde(default)]
    pub comment_count: Value,
    #[serde(default)]
    pub share_count: Value,
    #[serde(default)]
    pub create_time: Value,
}

/// The API sends either a comma-joined string or an array of URLs.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawDownloads {
    Many(Vec<Option<String>>),
    Joined(String),
}

impl RawDownloads {
    pub fn into_urls(self) -> Vec<String> {
        let urls: Vec<String> = match self {
            RawDownloads::Many(list) => list.into_iter().flatten().collect(),
            RawDownloads::Joined(s) => s.split(',').map(str::to_string).collect(),
        };
        urls.into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect()
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn count(v: &Value) -> i64 {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

pub fn media_kind(raw: Option<&str>) -> MediaKind {
    match raw.map(str::trim) {
        Some("图集" | "image" | "images" | "image_set" | "gallery") => MediaKind::ImageSet,
        _ => MediaKind::Video,
    }
}

impl RawMediaItem {
    /// `None` for entries without an id; those cannot be tracked.
    pub fn normalize(self) -> Option<MediaItem> {
        let id = text(&self.id);
        if id.trim().is_empty() {
            return None;
        }
        let cover_url = self
            .static_cover
            .filter(|c| !c.is_empty())
            .or(self.dynamic_cover)
            .unwrap_or_default();
        Some(MediaItem {
            id,
            kind: media_kind(self.item_type.as_deref()),
            description: self.desc.unwrap_or_default(),
            nickname: self.nickname.unwrap_or_default(),
            uid: text(&self.uid),
            cover_url,
            download_urls: self.downloads.map(RawDownloads::into_urls).unwrap_or_default(),
            duration: text(&self.duration),
            like_count: count(&self.digg_count),
            comment_count: count(&self.comment_count),
            share_count: count(&self.share_count),
            create_time: text(&self.create_time),
        })
    }
}

impl AccountResponse {
    pub fn into_fetch_response(self) -> FetchResponse {
        let items = self
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(RawMediaItem::normalize)
            .collect();
        FetchResponse {
            message: self.message.unwrap_or_default(),
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> FetchResponse {
        serde_json::from_str::<AccountResponse>(json)
            .unwrap()
            .into_fetch_response()
    }

    #[test]
    fn joined_download_string_is_split() {
        let resp = parse(
            r#"{"message":"获取数据成功","data":[
                {"id":"1","type":"图集","downloads":" u1, u2 ,,u3 "}
            ]}"#,
        );
        let item = &resp.items[0];
        assert_eq!(item.kind, MediaKind::ImageSet);
        assert_eq!(item.download_urls, vec!["u1", "u2", "u3"]);
    }

    #[test]
    fn download_array_drops_nulls_and_blanks() {
        let resp = parse(
            r#"{"message":"ok","data":[{"id":"2","type":"视频","downloads":["v1",null,""]}]}"#,
        );
        assert_eq!(resp.items[0].kind, MediaKind::Video);
        assert_eq!(resp.items[0].download_urls, vec!["v1"]);
    }

    #[test]
    fn numeric_fields_accept_numbers_and_strings() {
        let resp = parse(
            r#"{"message":"ok","data":[{
                "id":7300000000000000001,"uid":42,"digg_count":"500",
                "comment_count":7,"share_count":null,"create_time":1700000000,
                "duration":"00:00:15"
            }]}"#,
        );
        let item = &resp.items[0];
        assert_eq!(item.id, "7300000000000000001");
        assert_eq!(item.uid, "42");
        assert_eq!(item.like_count, 500);
        assert_eq!(item.comment_count, 7);
        assert_eq!(item.share_count, 0);
        assert_eq!(item.create_time, "1700000000");
    }

    #[test]
    fn cover_prefers_static() {
        let resp = parse(
            r#"{"message":"ok","data":[
                {"id":"a","static_cover":"s","dynamic_cover":"d"},
                {"id":"b","static_cover":"","dynamic_cover":"d"}
            ]}"#,
        );
        assert_eq!(resp.items[0].cover_url, "s");
        assert_eq!(resp.items[1].cover_url, "d");
    }

    #[test]
    fn entries_without_id_are_dropped() {
        let resp = parse(r#"{"message":"ok","data":[{"desc":"orphan"},{"id":"x"}]}"#);
        assert_eq!(resp.items.len(), 1);
        assert_eq!(resp.items[0].id, "x");
    }

    #[test]
    fn missing_data_is_empty() {
        let resp = parse(r#"{"message":"参数错误"}"#);
        assert!(resp.items.is_empty());
        assert!(!resp.is_success("成功"));
    }
}
