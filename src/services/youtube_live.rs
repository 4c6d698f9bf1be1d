// YouTube Data API：根据频道句柄查询当前直播视频。
use crate::core::config::YoutubeConfig;
use anyhow::anyhow;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

pub const DEFAULT_YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

#[derive(Debug, Error)]
pub enum LiveIdError {
    #[error("missing handle")]
    MissingHandle,
    #[error("youtube api key is not configured")]
    MissingApiKey,
    #[error("channel not found for {0}")]
    ChannelNotFound(String),
    #[error("failed to fetch live id: {0}")]
    Upstream(String),
}

impl LiveIdError {
    fn upstream(err: anyhow::Error) -> Self {
        Self::Upstream(format!("{err:#}"))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingHandle => "MISSING_HANDLE",
            Self::MissingApiKey => "CONFIGURATION_ERROR",
            Self::ChannelNotFound(_) => "CHANNEL_NOT_FOUND",
            Self::Upstream(_) => "UPSTREAM_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelQuery {
    Handle(String),
    ChannelId(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveIdResult {
    pub channel_id: String,
    pub live_video_id: Option<String>,
}

// 支持 `@handle`、裸名称或频道链接。
pub fn parse_channel_query(input: &str) -> Option<ChannelQuery> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut query = trimmed.to_string();
    if trimmed.starts_with("http") {
        if let Ok(url) = Url::parse(trimmed) {
            let path = url.path().trim_matches('/');
            if path.starts_with('@') {
                query = path.split('/').next().unwrap_or(path).to_string();
            } else if let Some(rest) = path.strip_prefix("channel/") {
                let id = rest.split('/').next().unwrap_or_default().trim();
                if id.is_empty() {
                    return None;
                }
                return Some(ChannelQuery::ChannelId(id.to_string()));
            } else if path.starts_with("c/") || path.starts_with("user/") {
                query = path.split('/').nth(1).unwrap_or_default().to_string();
            }
        }
    }
    let name = query.trim().trim_start_matches('@');
    if name.is_empty() {
        return None;
    }
    Some(ChannelQuery::Handle(format!("@{name}")))
}

pub struct LiveIdResolver {
    http: Client,
    api_base: String,
    api_key: Option<String>,
}

impl LiveIdResolver {
    pub fn new(http: Client, config: &YoutubeConfig, api_key: Option<String>) -> Self {
        let api_base = config
            .api_base
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_YOUTUBE_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Self {
            http,
            api_base,
            api_key,
        }
    }

    pub async fn resolve(&self, input: &str) -> Result<LiveIdResult, LiveIdError> {
        let query = parse_channel_query(input).ok_or(LiveIdError::MissingHandle)?;
        let api_key = self
            .api_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or(LiveIdError::MissingApiKey)?;
        let channel_id = match query {
            ChannelQuery::ChannelId(id) => id,
            ChannelQuery::Handle(handle) => {
                let payload = self
                    .get_json(
                        "channels",
                        &[("part", "id"), ("forHandle", handle.as_str()), ("key", api_key)],
                    )
                    .await
                    .map_err(LiveIdError::upstream)?;
                first_item_str(&payload, &["id"])
                    .ok_or_else(|| LiveIdError::ChannelNotFound(input.trim().to_string()))?
            }
        };
        let payload = self
            .get_json(
                "search",
                &[
                    ("part", "id"),
                    ("channelId", channel_id.as_str()),
                    ("eventType", "live"),
                    ("type", "video"),
                    ("key", api_key),
                ],
            )
            .await
            .map_err(LiveIdError::upstream)?;
        let live_video_id = first_item_str(&payload, &["id", "videoId"]);
        Ok(LiveIdResult {
            channel_id,
            live_video_id,
        })
    }

    async fn get_json(&self, resource: &str, params: &[(&str, &str)]) -> anyhow::Result<Value> {
        let url = Url::parse_with_params(&format!("{}/{resource}", self.api_base), params)?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("youtube {resource} failed: {status} {body}"));
        }
        Ok(response.json().await?)
    }
}

fn first_item_str(payload: &Value, path: &[&str]) -> Option<String> {
    let mut cursor = payload.get("items")?.get(0)?;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    cursor
        .as_str()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
