//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::fetcher::{FetchRequest, FetchResponse, MediaFetcher, MediaItem};
use crate::model::MediaKind;

/// Minimal HTTP/1.1 file server on a random local port. Unknown paths get a 404.
pub async fn serve_files(routes: Vec<(&str, Vec<u8>)>) -> String {
    let routes: Arc<HashMap<String, Vec<u8>>> = Arc::new(
        routes
            .into_iter()
            .map(|(path, body)| (path.to_string(), body))
            .collect(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match sock.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&buf);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                let (status, body) = match routes.get(&path) {
                    Some(body) => ("200 OK", body.clone()),
                    None => ("404 Not Found", Vec::new()),
                };
                let header = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = sock.write_all(header.as_bytes()).await;
                let _ = sock.write_all(&body).await;
                let _ = sock.shutdown().await;
            });
        }
    });

    format!("http://{addr}")
}

/// Serves one response with no Content-Length: `head` is sent at once, `tail`
/// only after `gate` is notified, then the connection closes.
pub async fn serve_gated_stream(head: Vec<u8>, tail: Vec<u8>, gate: Arc<Notify>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((mut sock, _)) = listener.accept().await else {
            return;
        };
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            match sock.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let _ = sock
            .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n")
            .await;
        let _ = sock.write_all(&head).await;
        let _ = sock.flush().await;
        gate.notified().await;
        let _ = sock.write_all(&tail).await;
        let _ = sock.shutdown().await;
    });

    format!("http://{addr}")
}

/// Fetcher double serving a fixed item list (newest first), switchable at runtime.
#[derive(Clone, Default)]
pub struct StaticFetcher {
    state: Arc<Mutex<FetcherState>>,
}

#[derive(Default)]
struct FetcherState {
    message: String,
    items: Vec<MediaItem>,
    fail: Option<String>,
    requests: Vec<FetchRequest>,
}

impl StaticFetcher {
    pub fn new(items: Vec<MediaItem>) -> Self {
        let fetcher = Self::default();
        fetcher.set_items(items);
        fetcher
    }

    pub fn set_items(&self, items: Vec<MediaItem>) {
        let mut state = self.state.lock().unwrap();
        state.message = "获取数据成功".into();
        state.items = items;
        state.fail = None;
    }

    /// Respond with `message` and no items.
    pub fn set_message(&self, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.message = message.into();
        state.items.clear();
    }

    pub fn fail_with(&self, error: &str) {
        self.state.lock().unwrap().fail = Some(error.into());
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl MediaFetcher for StaticFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        if let Some(error) = &state.fail {
            return Err(Error::Fetch(error.clone()));
        }
        let mut items = state.items.clone();
        if let Some(limit) = request.limit {
            items.truncate(limit as usize);
        }
        Ok(FetchResponse {
            message: state.message.clone(),
            items,
        })
    }
}

pub fn media_item(id: &str, kind: MediaKind, likes: i64, urls: Vec<String>) -> MediaItem {
    MediaItem {
        id: id.to_string(),
        kind,
        description: format!("post {id}"),
        nickname: "alice".into(),
        uid: "1001".into(),
        cover_url: String::new(),
        download_urls: urls,
        duration: "12".into(),
        like_count: likes,
        comment_count: 0,
        share_count: 0,
        create_time: "1700000000".into(),
    }
}
