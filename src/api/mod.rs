// API 路由汇总入口，按领域拆分以保持结构清晰。
pub mod chat_stream;
pub mod errors;
pub mod live_id;
pub mod status;

use crate::core::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(status::router())
        .merge(chat_stream::router())
        .merge(live_id::router())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::relay::testing::MockFactory;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router() -> Router {
        let state = AppState::with_factory(Config::default(), MockFactory::misconfigured())
            .expect("state");
        build_router(Arc::new(state))
    }

    async fn get(path: &str) -> (StatusCode, Value) {
        let response = router()
            .oneshot(Request::get(path).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_reports_ok() {
        assert_eq!(get("/health").await, (StatusCode::OK, json!({ "ok": true })));
    }

    #[tokio::test]
    async fn chat_route_maps_relay_errors() {
        let (status, payload) = get("/chat/mixer/someone").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(payload["error"]["code"], json!("UNKNOWN_PLATFORM"));

        let (status, payload) = get("/chat/tiktok").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["error"]["code"], json!("INVALID_CHANNEL"));

        let (status, payload) = get("/chat/TIKTOK/alice").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(payload["error"]["code"], json!("CONFIGURATION_ERROR"));
    }

    #[tokio::test]
    async fn status_lists_no_channels_on_fresh_pool() {
        let (status, payload) = get("/chat/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["channels"], json!([]));
        assert_eq!(payload["subscribers"], json!(0));
    }

    #[tokio::test]
    async fn live_id_requires_handle() {
        let (status, payload) = get("/youtube/live-id?handle=").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["error"]["code"], json!("MISSING_HANDLE"));
    }
}
