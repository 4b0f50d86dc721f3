use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::{PostResult, Profile};
use crate::posting::model::{CreatePostRequest, CreatePostResponse, ListProfilesResponse};

pub mod model;

/// A single publish attempt was rejected or never reached the aggregator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("posting failed ({}): {message}", status_label(.status))]
pub struct PostingError {
    /// HTTP status of the rejection, `None` when the request never completed.
    pub status: Option<u16>,
    pub message: String,
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {code}"),
        None => "transport".to_string(),
    }
}

impl PostingError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Network and auth failures; repeating them suggests the rest of the run will fail too.
    pub fn is_systemic(&self) -> bool {
        matches!(self.status, None | Some(401) | Some(403))
    }
}

/// The aggregator API as seen by the orchestrator.
#[async_trait]
pub trait PostingApi: Send + Sync {
    async fn list_profiles(&self) -> Result<Vec<Profile>, PostingError>;

    async fn create_post(
        &self,
        text: &str,
        profile_ids: &[String],
        media_urls: &[String],
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<PostResult, PostingError>;
}

#[derive(Clone)]
pub struct HttpPostingClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for HttpPostingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpPostingClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpPostingClient {
    pub fn new(base_url: Url, api_key: String) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("postcadence/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.posting.base_url).context("invalid posting.base_url")?;
        Self::new(base_url, cfg.posting.api_key.clone())
    }

    fn endpoint(&self, path: &str) -> Result<Url, PostingError> {
        self.base_url
            .join(path)
            .map_err(|err| PostingError::transport(format!("invalid endpoint {path}: {err}")))
    }

    pub fn build_post_request(
        &self,
        body: &CreatePostRequest<'_>,
    ) -> Result<reqwest::Request, PostingError> {
        let endpoint = self.endpoint("v1/posts")?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .map_err(|err| PostingError::transport(format!("failed to build request: {err}")))
    }

    async fn read_failure(res: reqwest::Response) -> PostingError {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("Rate limited by aggregator: {}", body);
        } else {
            warn!("Aggregator API error - Status: {}, Body: {}", status, body);
        }
        let message = if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request rejected")
                .to_string()
        } else {
            body
        };
        PostingError::http(status.as_u16(), message)
    }
}

#[async_trait]
impl PostingApi for HttpPostingClient {
    async fn list_profiles(&self) -> Result<Vec<Profile>, PostingError> {
        let url = self.endpoint("v1/profiles")?;
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| PostingError::transport(format!("failed to reach aggregator: {err}")))?;
        if !res.status().is_success() {
            return Err(Self::read_failure(res).await);
        }
        let payload: ListProfilesResponse = res
            .json()
            .await
            .map_err(|err| PostingError::transport(format!("invalid profiles response: {err}")))?;
        Ok(payload.data)
    }

    async fn create_post(
        &self,
        text: &str,
        profile_ids: &[String],
        media_urls: &[String],
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<PostResult, PostingError> {
        let body = CreatePostRequest {
            caption: text,
            profile_ids,
            media_urls,
            scheduled_at,
        };
        let request = self.build_post_request(&body)?;
        debug!(url = %request.url(), profiles = profile_ids.len(), media = media_urls.len(), "creating post");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|err| PostingError::transport(format!("failed to reach aggregator: {err}")))?;
        if !res.status().is_success() {
            return Err(Self::read_failure(res).await);
        }

        let payload: CreatePostResponse = res
            .json()
            .await
            .map_err(|err| PostingError::transport(format!("invalid post response: {err}")))?;
        info!(post_id = %payload.id, "post created");
        Ok(PostResult { id: payload.id })
    }
}
