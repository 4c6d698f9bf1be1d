// 聊天订阅 SSE：每个客户端一个订阅句柄，断开即注销。
use crate::api::errors::coded_error_response;
use crate::core::state::AppState;
use crate::relay::{ChannelKey, ChatEvent, Platform, RelayError};
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderName};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{info, warn};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/{platform}/{handle}", get(chat_stream))
        .route("/chat/{platform}", get(chat_stream_missing_handle))
        .route("/chat/{platform}/", get(chat_stream_missing_handle))
        .route("/api/tiktok-chat/{username}/sse", get(legacy_tiktok_stream))
        .route("/api/youtube-chat/{id}", get(legacy_youtube_stream))
}

async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Path((platform, handle)): Path<(String, String)>,
) -> Response {
    open_stream(&state, &platform, &handle)
}

async fn chat_stream_missing_handle(
    State(state): State<Arc<AppState>>,
    Path(platform): Path<String>,
) -> Response {
    open_stream(&state, &platform, "")
}

async fn legacy_tiktok_stream(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Response {
    open_stream(&state, Platform::Tiktok.as_str(), &username)
}

async fn legacy_youtube_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    open_stream(&state, Platform::Youtube.as_str(), &id)
}

pub(crate) fn resolve_channel(platform: &str, handle: &str) -> Result<ChannelKey, RelayError> {
    let platform = Platform::parse(platform)
        .ok_or_else(|| RelayError::UnknownPlatform(platform.trim().to_string()))?;
    ChannelKey::new(platform, handle).ok_or(RelayError::InvalidChannel)
}

fn open_stream(state: &AppState, platform: &str, handle: &str) -> Response {
    let subscription = match resolve_channel(platform, handle)
        .and_then(|key| state.pool.subscribe(key))
    {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!("chat stream rejected: platform={platform}, handle={handle}, error={err}");
            return coded_error_response(err.code(), err.to_string());
        }
    };
    info!(
        "chat stream opened: channel={}, subscriber={}",
        subscription.key(),
        subscription.subscriber_id()
    );

    let stream = subscription.map(|event| Ok::<Event, Infallible>(to_sse_event(&event)));
    let keep_alive = Duration::from_secs(state.config.server.keep_alive_s.max(1));
    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response()
}

fn to_sse_event(event: &ChatEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(payload) => Event::default().data(payload),
        Err(err) => {
            warn!("chat event serialize failed: {err}");
            Event::default().comment("serialize-error")
        }
    }
}
