//! Docker Hub tag listing.
//!
//! Reads `GET {base}/repositories/{namespace}/{name}/tags` one page at a
//! time, most recently updated first. Status handling: 429 becomes
//! [`MirrorError::RateLimited`] with the `Retry-After` delay (60 s when
//! absent), any other non-success status becomes
//! [`MirrorError::RegistryError`], and connect or timeout failures become
//! [`MirrorError::RegistryUnreachable`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imirror_core::catalog::Architecture;
use imirror_core::config::RegistryConfig;
use imirror_core::error::{MirrorError, Result};
use reqwest::header::HeaderMap;
use serde::Deserialize;

use super::{RemoteTag, TagPage, TagSource};

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<HubTag>,
}

#[derive(Deserialize)]
struct HubTag {
    name: String,
    #[serde(default)]
    tag_last_pushed: Option<DateTime<Utc>>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    images: Vec<HubImage>,
}

#[derive(Deserialize)]
struct HubImage {
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    os: Option<String>,
}

/// Tag source backed by the Docker Hub HTTP API.
pub struct HubTagSource {
    http: reqwest::Client,
    base_url: String,
    page_size: u32,
}

impl HubTagSource {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(concat!("imirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MirrorError::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.hub_api_url.trim_end_matches('/').to_string(),
            page_size: config.page_size,
        })
    }

    fn tags_url(&self, repository: &str) -> String {
        format!("{}/repositories/{}/tags", self.base_url, repository)
    }
}

#[async_trait]
impl TagSource for HubTagSource {
    async fn fetch_page(&self, repository: &str, page: u32) -> Result<TagPage> {
        tracing::debug!(repository, page, "Fetching tag page");

        let resp = self
            .http
            .get(self.tags_url(repository))
            .query(&[
                ("page_size", self.page_size.to_string()),
                ("page", page.to_string()),
                ("ordering", "last_updated".to_string()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(repository, e))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(MirrorError::RateLimited {
                repository: repository.to_string(),
                retry_after_secs: parse_retry_after(resp.headers()),
            });
        }
        if !status.is_success() {
            return Err(MirrorError::RegistryError {
                repository: repository.to_string(),
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| transport_error(repository, e))?;
        parse_page(repository, &body)
    }
}

fn transport_error(repository: &str, err: reqwest::Error) -> MirrorError {
    MirrorError::RegistryUnreachable {
        repository: repository.to_string(),
        message: err.to_string(),
    }
}

/// Parse the `Retry-After` header as seconds, falling back to 60 s.
fn parse_retry_after(headers: &HeaderMap) -> u64 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// Parse one page of the tags endpoint.
fn parse_page(repository: &str, body: &str) -> Result<TagPage> {
    let data: TagsResponse = serde_json::from_str(body).map_err(|e| MirrorError::RegistryError {
        repository: repository.to_string(),
        status: 200,
        message: format!("unexpected tags response: {}", e),
    })?;

    let has_next = data.next.is_some_and(|next| !next.is_empty()) && !data.results.is_empty();
    let tags = data
        .results
        .into_iter()
        .map(|tag| {
            let mut architectures: Vec<Architecture> = tag
                .images
                .iter()
                .filter(|image| image.os.as_deref().map_or(true, |os| os == "linux"))
                .filter_map(|image| image.architecture.as_deref()?.parse().ok())
                .collect();
            architectures.sort();
            architectures.dedup();

            RemoteTag {
                name: tag.name,
                architectures,
                pushed_at: tag.tag_last_pushed.or(tag.last_updated),
            }
        })
        .collect();

    Ok(TagPage { tags, has_next })
}
