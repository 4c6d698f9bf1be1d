// 中继领域类型：平台、频道键与聊天事件。
use serde::{Deserialize, Serialize};
use std::fmt;

pub const TIKTOK_PLATFORM: &str = "tiktok";
pub const YOUTUBE_PLATFORM: &str = "youtube";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Tiktok,
    Youtube,
}

impl Platform {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            TIKTOK_PLATFORM => Some(Self::Tiktok),
            YOUTUBE_PLATFORM => Some(Self::Youtube),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tiktok => TIKTOK_PLATFORM,
            Self::Youtube => YOUTUBE_PLATFORM,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    platform: Platform,
    handle: String,
}

impl ChannelKey {
    pub fn new(platform: Platform, raw_handle: &str) -> Option<Self> {
        let trimmed = raw_handle.trim();
        let trimmed = trimmed.strip_prefix('@').unwrap_or(trimmed).trim();
        if trimmed.is_empty() {
            return None;
        }
        // TikTok 用户名不区分大小写，YouTube 视频 id 区分。
        let handle = match platform {
            Platform::Tiktok => trimmed.to_ascii_lowercase(),
            Platform::Youtube => trimmed.to_string(),
        };
        Some(Self { platform, handle })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.platform {
            Platform::Tiktok => write!(f, "{}:@{}", self.platform, self.handle),
            Platform::Youtube => write!(f, "{}:{}", self.platform, self.handle),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatEvent {
    #[serde(skip)]
    pub id: Option<String>,
    pub user: String,
    pub message: String,
    pub timestamp: i64,
}

impl ChatEvent {
    pub fn new(user: impl Into<String>, message: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: None,
            user: user.into(),
            message: message.into(),
            timestamp,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.id = if id.trim().is_empty() { None } else { Some(id) };
        self
    }

    // 上游未提供 id 时合成 `user:text:second`。
    pub fn dedupe_key(&self) -> String {
        match self.id.as_deref() {
            Some(id) => format!("id:{id}"),
            None => format!(
                "syn:{}:{}:{}",
                self.user,
                self.message,
                self.timestamp.div_euclid(1000)
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Backoff,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiktok_handles_are_normalized() {
        let key = ChannelKey::new(Platform::Tiktok, "  @Alice ").expect("key");
        assert_eq!(key.handle(), "alice");
        assert_eq!(key, ChannelKey::new(Platform::Tiktok, "alice").expect("key"));
        assert_eq!(key.to_string(), "tiktok:@alice");
    }

    #[test]
    fn youtube_ids_keep_case() {
        let key = ChannelKey::new(Platform::Youtube, "dQw4w9WgXcQ").expect("key");
        assert_eq!(key.handle(), "dQw4w9WgXcQ");
        assert_ne!(
            key,
            ChannelKey::new(Platform::Youtube, "dqw4w9wgxcq").expect("key")
        );
    }

    #[test]
    fn empty_handles_are_rejected() {
        assert!(ChannelKey::new(Platform::Tiktok, "").is_none());
        assert!(ChannelKey::new(Platform::Tiktok, " @ ").is_none());
    }

    #[test]
    fn same_platform_different_handles_are_distinct() {
        let alice = ChannelKey::new(Platform::Tiktok, "alice").expect("key");
        let youtube_alice = ChannelKey::new(Platform::Youtube, "alice").expect("key");
        assert_ne!(alice, youtube_alice);
    }

    #[test]
    fn dedupe_key_prefers_explicit_id() {
        let event = ChatEvent::new("bob", "hi", 1_700_000_000_123).with_id("m1");
        assert_eq!(event.dedupe_key(), "id:m1");
    }

    #[test]
    fn synthesized_dedupe_key_uses_second_granularity() {
        let first = ChatEvent::new("bob", "hi", 1_700_000_000_100);
        let second = ChatEvent::new("bob", "hi", 1_700_000_000_900);
        let later = ChatEvent::new("bob", "hi", 1_700_000_001_000);
        assert_eq!(first.dedupe_key(), second.dedupe_key());
        assert_ne!(first.dedupe_key(), later.dedupe_key());
    }

    #[test]
    fn platform_parse_is_case_insensitive() {
        assert_eq!(Platform::parse("TikTok"), Some(Platform::Tiktok));
        assert_eq!(Platform::parse("youtube"), Some(Platform::Youtube));
        assert_eq!(Platform::parse("twitch"), None);
    }

    #[test]
    fn chat_event_serializes_public_fields_only() {
        let event = ChatEvent::new("bob", "hi", 42).with_id("m1");
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(
            value,
            serde_json::json!({"user": "bob", "message": "hi", "timestamp": 42})
        );
    }
}
