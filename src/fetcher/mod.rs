//! Media Fetcher: the content API that lists an account's posts.

mod client;
mod types;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;
use crate::model::MediaKind;

pub use client::ApiClient;

/// One remote post as the core sees it, after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub id: String,
    pub kind: MediaKind,
    pub description: String,
    pub nickname: String,
    pub uid: String,
    pub cover_url: String,
    /// Ordered; one entry for a video, one per image for an image set.
    pub download_urls: Vec<String>,
    pub duration: String,
    pub like_count: i64,
    pub comment_count: i64,
    pub share_count: i64,
    pub create_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub account_id: String,
    /// Inclusive `(earliest, latest)`; `None` asks for everything.
    pub range: Option<(NaiveDate, NaiveDate)>,
    /// Cap on returned items, used when only probing an account.
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub message: String,
    /// Newest first, as the API returns them.
    pub items: Vec<MediaItem>,
}

impl FetchResponse {
    pub fn is_success(&self, marker: &str) -> bool {
        !marker.is_empty() && self.message.contains(marker)
    }
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}
