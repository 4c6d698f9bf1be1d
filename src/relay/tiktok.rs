// TikTok 推送连接器：通过签名服务的 websocket 接收弹幕。
use crate::core::config::{TiktokConfig, TiktokCredentials};
use crate::relay::connector::ConnectorCallbacks;
use crate::relay::error::ConnectError;
use crate::relay::types::{now_millis, ChatEvent};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_TIKTOK_WS_ENDPOINT: &str = "wss://ws.eulerstream.com";

#[derive(Debug, Clone)]
pub struct TiktokSettings {
    pub endpoint: String,
    pub account_id: String,
    pub secret: String,
    pub connect_timeout: Duration,
}

impl TiktokSettings {
    pub fn new(credentials: TiktokCredentials, config: &TiktokConfig, connect_timeout: Duration) -> Self {
        let endpoint = config
            .ws_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_TIKTOK_WS_ENDPOINT)
            .to_string();
        Self {
            endpoint,
            account_id: credentials.account_id,
            secret: credentials.secret,
            connect_timeout,
        }
    }
}

pub struct TiktokConnector {
    unique_id: String,
    settings: TiktokSettings,
    cancel: Option<CancellationToken>,
    reader: Option<JoinHandle<()>>,
}

impl TiktokConnector {
    pub fn new(unique_id: &str, settings: TiktokSettings) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            settings,
            cancel: None,
            reader: None,
        }
    }

    pub async fn connect(&mut self, callbacks: ConnectorCallbacks) -> Result<(), ConnectError> {
        self.disconnect().await;
        let url = build_ws_url(&self.settings.endpoint, &self.unique_id, &self.settings.secret)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectError::Fatal(format!("invalid tiktok endpoint: {err}")))?;
        if let Ok(value) = HeaderValue::from_str(&self.settings.account_id) {
            request.headers_mut().insert("x-account-id", value);
        }

        let (stream, _) = match timeout(self.settings.connect_timeout, connect_async(request)).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => return Err(classify_ws_error(err)),
            Err(_) => {
                return Err(ConnectError::Transient(format!(
                    "tiktok connect timed out after {}s",
                    self.settings.connect_timeout.as_secs()
                )))
            }
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let unique_id = self.unique_id.clone();
        let reader = tokio::spawn(async move {
            let (mut write, mut read) = stream.split();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = write.send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        }))).await;
                        return;
                    }
                    next = read.next() => match next {
                        Some(Ok(Message::Text(text))) => {
                            let frame = parse_frame(&text, now_millis());
                            if let Some(error) = frame.error {
                                callbacks.on_error(error);
                            }
                            for event in frame.events {
                                callbacks.on_chat(event);
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            if let Some(frame) = frame {
                                if !frame.reason.is_empty() {
                                    callbacks.on_error(format!(
                                        "upstream closed: {} {}",
                                        u16::from(frame.code),
                                        frame.reason
                                    ));
                                }
                            }
                            callbacks.on_disconnected();
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("tiktok read failed: unique_id={unique_id}, error={err}");
                            callbacks.on_error(err.to_string());
                            callbacks.on_disconnected();
                            return;
                        }
                        None => {
                            debug!("tiktok stream ended: unique_id={unique_id}");
                            callbacks.on_disconnected();
                            return;
                        }
                    }
                }
            }
        });
        self.cancel = Some(cancel);
        self.reader = Some(reader);
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(reader) = self.reader.take() {
            if timeout(Duration::from_secs(2), reader).await.is_err() {
                debug!("tiktok reader did not stop in time: unique_id={}", self.unique_id);
            }
        }
    }
}

impl Drop for TiktokConnector {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

fn build_ws_url(endpoint: &str, unique_id: &str, secret: &str) -> Result<Url, ConnectError> {
    let mut url = Url::parse(endpoint)
        .map_err(|err| ConnectError::Fatal(format!("invalid tiktok endpoint {endpoint}: {err}")))?;
    url.query_pairs_mut()
        .append_pair("uniqueId", unique_id)
        .append_pair("apiKey", secret);
    Ok(url)
}

fn classify_ws_error(err: WsError) -> ConnectError {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .map(|bytes| String::from_utf8_lossy(bytes).to_string())
                .unwrap_or_default();
            ConnectError::from_status(status, format!("tiktok handshake rejected: {status} {body}"))
        }
        other => ConnectError::from_reason(other.to_string()),
    }
}

#[derive(Debug, Default)]
pub(crate) struct ParsedFrame {
    pub events: Vec<ChatEvent>,
    pub error: Option<String>,
}

pub(crate) fn parse_frame(text: &str, arrival: i64) -> ParsedFrame {
    let mut parsed = ParsedFrame::default();
    let Ok(payload) = serde_json::from_str::<Value>(text) else {
        return parsed;
    };
    if let Some(error) = extract_error(&payload) {
        parsed.error = Some(error);
    }
    match payload.get("messages").and_then(Value::as_array) {
        Some(messages) => {
            for message in messages {
                if let Some(event) = parse_chat_message(message, arrival) {
                    parsed.events.push(event);
                }
            }
        }
        None => {
            if let Some(event) = parse_chat_message(&payload, arrival) {
                parsed.events.push(event);
            }
        }
    }
    parsed
}

fn extract_error(payload: &Value) -> Option<String> {
    let kind = payload.get("type").and_then(Value::as_str).unwrap_or("");
    if kind.eq_ignore_ascii_case("error") {
        let message = payload
            .get("message")
            .or_else(|| payload.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Some(message.to_string());
    }
    payload
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn parse_chat_message(message: &Value, arrival: i64) -> Option<ChatEvent> {
    let kind = message
        .get("type")
        .or_else(|| message.get("event"))
        .and_then(Value::as_str)?;
    let is_chat = kind.eq_ignore_ascii_case("chat") || kind.ends_with("ChatMessage");
    if !is_chat {
        return None;
    }
    let data = message.get("data").unwrap_or(message);
    let user = data
        .pointer("/user/uniqueId")
        .or_else(|| data.get("uniqueId"))
        .or_else(|| data.pointer("/user/nickname"))
        .and_then(Value::as_str)?;
    let comment = data.get("comment").and_then(Value::as_str)?;
    let event = ChatEvent::new(user, comment, arrival);
    let msg_id = data
        .pointer("/common/msgId")
        .or_else(|| data.get("msgId"))
        .and_then(|value| match value {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        });
    Some(match msg_id {
        Some(id) => event.with_id(id),
        None => event,
    })
}
