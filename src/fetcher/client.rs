use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;

use super::types::AccountResponse;
use super::{FetchRequest, FetchResponse, MediaFetcher};
use crate::config::ApiConfig;
use crate::error::{Error, Result};

const ACCOUNT_PATH: &str = "/douyin/account";
const MAX_RETRIES: u32 = 5;

/// HTTP adapter for the media API.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct AccountQuery<'a> {
    sec_user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    earliest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<u32>,
}

/// The API takes `YYYY/MM/DD`.
fn api_date(date: NaiveDate) -> String {
    date.format("%Y/%m/%d").to_string()
}

impl ApiClient {
    pub fn new(cfg: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            token: cfg.token.clone().filter(|t| !t.is_empty()),
        })
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let builder = self.http.post(format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send with retry on rate-limit (429).
    async fn send(&self, mut builder: RequestBuilder) -> Result<Response> {
        for attempt in 0..=MAX_RETRIES {
            let retry_builder = builder.try_clone();

            let resp = builder
                .send()
                .await
                .map_err(|e| Error::Fetch(format!("media API unreachable: {e}")))?;

            match resp.status() {
                s if s.is_success() => return Ok(resp),

                StatusCode::TOO_MANY_REQUESTS if attempt < MAX_RETRIES => {
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(2);
                    let wait = Duration::from_secs(retry_after) + jitter();
                    tracing::warn!(
                        retry_after,
                        attempt = attempt + 1,
                        "media API rate limited, waiting {wait:?}"
                    );
                    tokio::time::sleep(wait).await;

                    match retry_builder {
                        Some(b) => builder = b,
                        None => {
                            return Err(Error::Fetch(
                                "rate limited and request cannot be replayed".into(),
                            ));
                        }
                    }
                }

                StatusCode::TOO_MANY_REQUESTS => {
                    return Err(Error::Fetch(format!(
                        "rate limited, exhausted {MAX_RETRIES} retries"
                    )));
                }

                status => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(Error::Fetch(format!("media API error ({status}): {body}")));
                }
            }
        }

        Err(Error::Fetch("rate limited, retries exhausted".into()))
    }
}

#[async_trait]
impl MediaFetcher for ApiClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let query = AccountQuery {
            sec_user_id: &request.account_id,
            earliest: request.range.map(|(from, _)| api_date(from)),
            latest: request.range.map(|(_, to)| api_date(to)),
            count: request.limit,
        };

        tracing::debug!(
            account_id = %request.account_id,
            earliest = ?query.earliest,
            latest = ?query.latest,
            "fetching account posts"
        );

        let resp = self.send(self.post(ACCOUNT_PATH).json(&query)).await?;
        let body: AccountResponse = resp
            .json()
            .await
            .map_err(|e| Error::Fetch(format!("failed to parse account response: {e}")))?;

        Ok(body.into_fetch_response())
    }
}

fn jitter() -> Duration {
    let ms: u64 = rand::random::<u64>() % 1000;
    Duration::from_millis(ms)
}
