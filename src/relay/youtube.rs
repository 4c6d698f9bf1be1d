// YouTube 轮询连接器：抓取直播页后循环拉取聊天续页。
use crate::core::config::YoutubeConfig;
use crate::relay::connector::ConnectorCallbacks;
use crate::relay::error::ConnectError;
use crate::relay::types::{now_millis, ChatEvent};
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_YOUTUBE_WATCH_BASE: &str = "https://www.youtube.com";
const DEFAULT_POLL_MIN_MS: u64 = 1000;
const DEFAULT_POLL_MAX_MS: u64 = 5000;
const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 5;

#[derive(Debug, Clone)]
pub struct YoutubeSettings {
    pub watch_base: String,
    pub poll_min: Duration,
    pub poll_max: Duration,
}

impl YoutubeSettings {
    pub fn from_config(config: &YoutubeConfig) -> Self {
        let watch_base = config
            .watch_base
            .as_deref()
            .map(|value| value.trim().trim_end_matches('/'))
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_YOUTUBE_WATCH_BASE)
            .to_string();
        let poll_min = if config.poll_min_ms == 0 {
            DEFAULT_POLL_MIN_MS
        } else {
            config.poll_min_ms
        };
        let poll_max = if config.poll_max_ms == 0 {
            DEFAULT_POLL_MAX_MS
        } else {
            config.poll_max_ms
        };
        Self {
            watch_base,
            poll_min: Duration::from_millis(poll_min),
            poll_max: Duration::from_millis(poll_max.max(poll_min)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LiveChatOptions {
    pub api_key: String,
    pub client_version: String,
    pub continuation: String,
}

#[derive(Debug, Default)]
pub(crate) struct LiveChatPage {
    pub events: Vec<ChatEvent>,
    pub continuation: Option<String>,
    pub timeout_ms: Option<u64>,
}

pub struct YoutubeConnector {
    live_id: String,
    http: Client,
    settings: YoutubeSettings,
    cancel: Option<CancellationToken>,
    poller: Option<JoinHandle<()>>,
}

impl YoutubeConnector {
    pub fn new(live_id: &str, http: Client, settings: YoutubeSettings) -> Self {
        Self {
            live_id: live_id.to_string(),
            http,
            settings,
            cancel: None,
            poller: None,
        }
    }

    pub async fn connect(&mut self, callbacks: ConnectorCallbacks) -> Result<(), ConnectError> {
        self.disconnect().await;
        let url = format!("{}/watch?v={}", self.settings.watch_base, self.live_id);
        let response = self
            .http
            .get(&url)
            .header("accept-language", "en-US,en;q=0.9")
            .send()
            .await
            .map_err(|err| ConnectError::from_reason(format!("youtube page fetch failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectError::from_status(
                status.as_u16(),
                format!("youtube page fetch failed: {status} {}", truncate(&body, 200)),
            ));
        }
        let html = response
            .text()
            .await
            .map_err(|err| ConnectError::from_reason(format!("youtube page read failed: {err}")))?;
        let options = parse_live_page(&html)?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let http = self.http.clone();
        let settings = self.settings.clone();
        let live_id = self.live_id.clone();
        let poller = tokio::spawn(async move {
            poll_loop(http, settings, live_id, options, callbacks, token).await;
        });
        self.cancel = Some(cancel);
        self.poller = Some(poller);
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(poller) = self.poller.take() {
            poller.abort();
            let _ = poller.await;
        }
    }
}

impl Drop for YoutubeConnector {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

async fn poll_loop(
    http: Client,
    settings: YoutubeSettings,
    live_id: String,
    mut options: LiveChatOptions,
    callbacks: ConnectorCallbacks,
    cancel: CancellationToken,
) {
    let endpoint = format!(
        "{}/youtubei/v1/live_chat/get_live_chat?key={}",
        settings.watch_base, options.api_key
    );
    let mut failures = 0u32;
    let mut wait = Duration::ZERO;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(wait) => {}
        }
        let body = json!({
            "context": {
                "client": {
                    "clientName": "WEB",
                    "clientVersion": options.client_version,
                }
            },
            "continuation": options.continuation,
        });
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = fetch_chat(&http, &endpoint, &body) => result,
        };
        match result {
            Ok(page) => {
                failures = 0;
                for event in page.events {
                    callbacks.on_chat(event);
                }
                let Some(next) = page.continuation else {
                    debug!("youtube live chat ended: live_id={live_id}");
                    callbacks.on_disconnected();
                    return;
                };
                options.continuation = next;
                wait = page
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(settings.poll_min)
                    .clamp(settings.poll_min, settings.poll_max);
            }
            Err(err) => {
                failures += 1;
                warn!("youtube live chat poll failed: live_id={live_id}, attempt={failures}, error={err}");
                callbacks.on_error(err);
                if failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                    callbacks.on_disconnected();
                    return;
                }
                wait = settings.poll_max;
            }
        }
    }
}

async fn fetch_chat(http: &Client, endpoint: &str, body: &Value) -> Result<LiveChatPage, String> {
    let response = http
        .post(endpoint)
        .json(body)
        .send()
        .await
        .map_err(|err| err.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("live chat request failed: {status}"));
    }
    let payload: Value = response.json().await.map_err(|err| err.to_string())?;
    Ok(parse_live_chat(&payload))
}

fn page_regex(
    slot: &'static OnceLock<Option<Regex>>,
    pattern: &str,
) -> Result<&'static Regex, ConnectError> {
    slot.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .ok_or_else(|| ConnectError::Fatal(format!("invalid page pattern: {pattern}")))
}

pub(crate) fn parse_live_page(html: &str) -> Result<LiveChatOptions, ConnectError> {
    static CANONICAL: OnceLock<Option<Regex>> = OnceLock::new();
    static REPLAY: OnceLock<Option<Regex>> = OnceLock::new();
    static API_KEY: OnceLock<Option<Regex>> = OnceLock::new();
    static CLIENT_VERSION: OnceLock<Option<Regex>> = OnceLock::new();
    static CONTINUATION: OnceLock<Option<Regex>> = OnceLock::new();

    let canonical = page_regex(
        &CANONICAL,
        r#"<link rel="canonical" href="https://www\.youtube\.com/watch\?v=([^"]+)">"#,
    )?;
    if !canonical.is_match(html) {
        return Err(ConnectError::Fatal("live stream was not found".to_string()));
    }
    if page_regex(&REPLAY, r#"['"]isReplay['"]\s*:\s*true"#)?.is_match(html) {
        return Err(ConnectError::Fatal("live stream has finished".to_string()));
    }
    let api_key = page_regex(&API_KEY, r#"['"]INNERTUBE_API_KEY['"]\s*:\s*['"]([^'"]+)['"]"#)?
        .captures(html)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str().to_string())
        .ok_or_else(|| ConnectError::Transient("innertube api key was not found".to_string()))?;
    let client_version = page_regex(
        &CLIENT_VERSION,
        r#"['"]clientVersion['"]\s*:\s*['"]([\d.]+)['"]"#,
    )?
    .captures(html)
    .and_then(|captures| captures.get(1))
    .map(|value| value.as_str().to_string())
    .ok_or_else(|| ConnectError::Transient("client version was not found".to_string()))?;
    let continuation = page_regex(
        &CONTINUATION,
        r#"['"]continuation['"]\s*:\s*['"]([^'"]+)['"]"#,
    )?
    .captures(html)
    .and_then(|captures| captures.get(1))
    .map(|value| value.as_str().to_string())
    .ok_or_else(|| ConnectError::Fatal("live chat is not available".to_string()))?;
    Ok(LiveChatOptions {
        api_key,
        client_version,
        continuation,
    })
}

pub(crate) fn parse_live_chat(payload: &Value) -> LiveChatPage {
    let mut page = LiveChatPage::default();
    let Some(chat) = payload.pointer("/continuationContents/liveChatContinuation") else {
        return page;
    };
    if let Some(actions) = chat.get("actions").and_then(Value::as_array) {
        for action in actions {
            let Some(renderer) =
                action.pointer("/addChatItemAction/item/liveChatTextMessageRenderer")
            else {
                continue;
            };
            if let Some(event) = parse_text_message(renderer) {
                page.events.push(event);
            }
        }
    }
    if let Some(continuation) = chat
        .get("continuations")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
    {
        let data = continuation
            .get("invalidationContinuationData")
            .or_else(|| continuation.get("timedContinuationData"))
            .or_else(|| continuation.get("reloadContinuationData"));
        if let Some(data) = data {
            page.continuation = data
                .get("continuation")
                .and_then(Value::as_str)
                .map(str::to_string);
            page.timeout_ms = data.get("timeoutMs").and_then(Value::as_u64);
        }
    }
    page
}

fn parse_text_message(renderer: &Value) -> Option<ChatEvent> {
    let user = renderer
        .pointer("/authorName/simpleText")
        .and_then(Value::as_str)
        .unwrap_or("");
    let runs = renderer.pointer("/message/runs").and_then(Value::as_array)?;
    let message = runs
        .iter()
        .map(|run| {
            run.get("text")
                .or_else(|| run.pointer("/emoji/shortcuts/0"))
                .or_else(|| run.pointer("/emoji/emojiId"))
                .and_then(Value::as_str)
                .unwrap_or("")
        })
        .collect::<Vec<_>>()
        .join(" ");
    let timestamp = renderer
        .get("timestampUsec")
        .and_then(|value| match value {
            Value::String(text) => text.parse::<i64>().ok(),
            Value::Number(number) => number.as_i64(),
            _ => None,
        })
        .map(|usec| usec / 1000)
        .unwrap_or_else(now_millis);
    let event = ChatEvent::new(user, message, timestamp);
    Some(match renderer.get("id").and_then(Value::as_str) {
        Some(id) => event.with_id(id),
        None => event,
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE_PAGE: &str = r#"<html><head>
        <link rel="canonical" href="https://www.youtube.com/watch?v=abc123XYZ">
        </head><script>ytcfg.set({"INNERTUBE_API_KEY":"AIzaTestKey","INNERTUBE_CONTEXT":{"client":{"clientVersion":"2.20240101.00.00"}}});
        var ytInitialData = {"contents":{"liveChatRenderer":{"continuations":[{"reloadContinuationData":{"continuation":"0ofMyAN"}}]}}};</script></html>"#;

    #[test]
    fn live_page_options_are_extracted() {
        let options = parse_live_page(LIVE_PAGE).expect("options");
        assert_eq!(
            options,
            LiveChatOptions {
                api_key: "AIzaTestKey".to_string(),
                client_version: "2.20240101.00.00".to_string(),
                continuation: "0ofMyAN".to_string(),
            }
        );
    }

    #[test]
    fn replay_pages_are_fatal() {
        let html = LIVE_PAGE.replace("ytInitialData", "\"isReplay\":true, ytInitialData");
        let err = parse_live_page(&html).expect_err("replay");
        assert!(err.is_fatal());
    }

    #[test]
    fn pages_without_canonical_link_are_not_live() {
        let err = parse_live_page("<html></html>").expect_err("not live");
        assert_eq!(
            err,
            ConnectError::Fatal("live stream was not found".to_string())
        );
    }

    #[test]
    fn live_chat_actions_become_events() {
        let payload = json!({
            "continuationContents": {
                "liveChatContinuation": {
                    "continuations": [
                        {"timedContinuationData": {"continuation": "next-token", "timeoutMs": 2500}}
                    ],
                    "actions": [
                        {"addChatItemAction": {"item": {"liveChatTextMessageRenderer": {
                            "id": "msg-1",
                            "authorName": {"simpleText": "Bob"},
                            "message": {"runs": [{"text": "hello"}, {"emoji": {"shortcuts": [":wave:"]}}, {"text": "gg"}]},
                            "timestampUsec": "1700000000123456"
                        }}}},
                        {"addChatItemAction": {"item": {"liveChatPaidMessageRenderer": {"id": "paid"}}}},
                        {"markChatItemAsDeletedAction": {}}
                    ]
                }
            }
        });
        let page = parse_live_chat(&payload);
        assert_eq!(page.continuation.as_deref(), Some("next-token"));
        assert_eq!(page.timeout_ms, Some(2500));
        assert_eq!(page.events.len(), 1);
        let event = &page.events[0];
        assert_eq!(event.user, "Bob");
        // 消息片段之间以空格拼接。
        assert_eq!(event.message, "hello :wave: gg");
        assert_eq!(event.timestamp, 1_700_000_000_123);
        assert_eq!(event.id.as_deref(), Some("msg-1"));
    }

    #[test]
    fn missing_continuation_means_stream_ended() {
        let payload = json!({"continuationContents": {"liveChatContinuation": {"actions": []}}});
        let page = parse_live_chat(&payload);
        assert!(page.continuation.is_none());
        assert!(page.events.is_empty());
    }

    #[test]
    fn settings_clamp_poll_window() {
        let settings = YoutubeSettings::from_config(&YoutubeConfig {
            poll_min_ms: 3000,
            poll_max_ms: 1000,
            watch_base: Some("http://127.0.0.1:9/".to_string()),
            ..YoutubeConfig::default()
        });
        assert_eq!(settings.watch_base, "http://127.0.0.1:9");
        assert_eq!(settings.poll_min, Duration::from_millis(3000));
        assert_eq!(settings.poll_max, Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_before_connect() {
        let settings = YoutubeSettings::from_config(&YoutubeConfig::default());
        let mut connector = YoutubeConnector::new("abc", Client::new(), settings);
        connector.disconnect().await;
        connector.disconnect().await;
    }
}
