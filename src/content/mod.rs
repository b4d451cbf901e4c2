use crate::config::ContentConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const YOUTUBE_TV_URL: &str = "https://youtube.com/tv?v=";

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("content config error: {0}")]
    Config(&'static str),
    #[error("url error: {0}")]
    Url(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api error {}: {body}", .status.as_u16())]
    Api { status: StatusCode, body: String },
    #[error("{service} has nothing matching '{title}'")]
    NotFound {
        service: &'static str,
        title: String,
    },
}

#[async_trait]
pub trait ContentCatalog: Send + Sync {
    async fn youtube_target(&self, title: &str) -> Result<String, ContentError>;
    async fn netflix_target(&self, title: &str) -> Result<String, ContentError>;
}

#[derive(Clone, Debug)]
pub struct HttpCatalog {
    http: Client,
    youtube_search_url: Url,
    youtube_api_key: Option<String>,
    netflix_catalog_url: Url,
}

impl HttpCatalog {
    pub fn from_config(config: &ContentConfig) -> Result<Self, ContentError> {
        let parse = |raw: &str| Url::parse(raw.trim()).map_err(|err| ContentError::Url(err.to_string()));

        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            youtube_search_url: parse(&config.youtube_search_url)?,
            youtube_api_key: config
                .youtube_api_key
                .clone()
                .filter(|k| !k.trim().is_empty()),
            netflix_catalog_url: parse(&config.netflix_catalog_url)?,
        })
    }

    fn build_youtube_search(&self, title: &str) -> Result<reqwest::Request, ContentError> {
        let key = self
            .youtube_api_key
            .as_deref()
            .ok_or(ContentError::Config("content.youtube_api_key is not set"))?;
        Ok(self
            .http
            .get(self.youtube_search_url.clone())
            .query(&[
                ("part", "snippet"),
                ("type", "video"),
                ("maxResults", "1"),
                ("q", title),
                ("key", key),
            ])
            .build()?)
    }
}

#[async_trait]
impl ContentCatalog for HttpCatalog {
    async fn youtube_target(&self, title: &str) -> Result<String, ContentError> {
        let req = self.build_youtube_search(title)?;
        let resp = self.http.execute(req).await?;
        let status = resp.status();
        let body = resp.text().await?;
        let video_id = parse_youtube_search(status, &body)?.ok_or_else(|| ContentError::NotFound {
            service: "youtube",
            title: title.to_string(),
        })?;
        tracing::debug!(title, video_id = %video_id, "youtube match");
        Ok(youtube_target(&video_id))
    }

    async fn netflix_target(&self, title: &str) -> Result<String, ContentError> {
        let resp = self.http.get(self.netflix_catalog_url.clone()).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        let id = parse_netflix_catalog(status, &body, title)?.ok_or_else(|| {
            ContentError::NotFound {
                service: "netflix",
                title: title.to_string(),
            }
        })?;
        tracing::debug!(title, id = %id, "netflix match");
        Ok(netflix_target(&id))
    }
}

pub fn youtube_target(video_id: &str) -> String {
    format!("{YOUTUBE_TV_URL}{video_id}")
}

pub fn netflix_target(id: &str) -> String {
    format!("m=https%3A%2F%2Fapi.netflix.com%2Fcatalog%2Ftitles%2Fmovies%2F{id}&source_type=4")
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
}

#[derive(Debug, Deserialize)]
struct SearchItemId {
    #[serde(rename = "videoId", default)]
    video_id: Option<String>,
}

fn ensure_success(status: StatusCode, body: &str) -> Result<(), ContentError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(ContentError::Api {
            status,
            body: body.to_string(),
        })
    }
}

fn parse_youtube_search(status: StatusCode, body: &str) -> Result<Option<String>, ContentError> {
    ensure_success(status, body)?;
    let parsed: SearchResponse = serde_json::from_str(body)?;
    Ok(parsed.items.into_iter().find_map(|item| item.id.video_id))
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    movie: String,
    id: Value,
}

// First entry whose `movie` contains `title`, ignoring case.
fn parse_netflix_catalog(
    status: StatusCode,
    body: &str,
    title: &str,
) -> Result<Option<String>, ContentError> {
    ensure_success(status, body)?;
    let entries: Vec<CatalogEntry> = serde_json::from_str(body)?;
    let needle = title.to_lowercase();
    Ok(entries
        .into_iter()
        .find(|e| e.movie.to_lowercase().contains(&needle))
        .and_then(|e| match e.id {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }))
}
