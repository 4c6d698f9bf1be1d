// YouTube 直播 id 查询：频道句柄或链接 -> 当前直播视频。
use crate::api::errors::coded_error_response;
use crate::core::state::AppState;
use crate::services::youtube_live::{LiveIdError, LiveIdResolver};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct LiveIdQuery {
    #[serde(default)]
    handle: Option<String>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/youtube/live-id", get(live_id))
}

async fn live_id(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LiveIdQuery>,
) -> Response {
    let handle = query.handle.unwrap_or_default();
    let resolver = LiveIdResolver::new(
        state.http.clone(),
        &state.config.youtube,
        state.config.youtube_api_key(),
    );
    match resolver.resolve(&handle).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => {
            if matches!(err, LiveIdError::Upstream(_) | LiveIdError::MissingApiKey) {
                warn!("youtube live id lookup failed: handle={handle}, error={err}");
            }
            coded_error_response(err.code(), err.to_string())
        }
    }
}
