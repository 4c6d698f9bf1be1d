// 健康检查与连接池状态。
use crate::core::state::AppState;
use crate::relay::ChannelSnapshot;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/chat/status", get(pool_status))
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn pool_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let channels: Vec<ChannelSnapshot> = state.pool.snapshot();
    let subscribers: usize = channels.iter().map(|item| item.subscribers).sum();
    Json(json!({
        "ok": true,
        "channels": channels,
        "subscribers": subscribers,
    }))
}
