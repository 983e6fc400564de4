//! HTTP surface
//!
//! Room management under `/room` and media negotiation under `/stream`.
//! Bodies are plain JSON; errors are `{ "error", "status" }`.

pub mod error;
pub mod health;
pub mod room;
pub mod stream;

use axum::{
    routing::{get, post},
    Router,
};
use livecall_core::service::RoomLogic;
use livecall_sfu::{RtcService, TransportFactory};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Shared application state
pub struct AppState<T: TransportFactory> {
    pub logic: Arc<RoomLogic>,
    pub rtc: Arc<RtcService<T>>,
}

impl<T: TransportFactory> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            logic: self.logic.clone(),
            rtc: self.rtc.clone(),
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router<T: TransportFactory>(logic: Arc<RoomLogic>, rtc: Arc<RtcService<T>>) -> Router {
    let state = AppState { logic, rtc };

    let router = Router::new()
        .merge(health::create_health_router())
        .merge(create_room_router())
        .merge(create_stream_router());

    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    router.with_state(state)
}

fn create_room_router<T: TransportFactory>() -> Router<AppState<T>> {
    Router::new()
        .route("/room", post(room::create_room::<T>).delete(room::delete_room::<T>))
        .route("/room/{id}", get(room::get_room::<T>))
        .route("/room/join", post(room::join_room::<T>))
        .route("/room/call", post(room::call_members::<T>))
        .route("/room/call/cancel", post(room::cancel_call::<T>))
        .route("/room/invite", post(room::invite_members::<T>))
        .route("/room/refuse", post(room::refuse_join::<T>))
        .route("/room/leave", post(room::leave_room::<T>))
        .route("/room/kick", post(room::kick_members::<T>))
}

fn create_stream_router<T: TransportFactory>() -> Router<AppState<T>> {
    Router::new()
        .route("/stream/publish", post(stream::publish::<T>))
        .route("/stream/play", post(stream::play::<T>))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use http_body_util::BodyExt;
    use livecall_cluster::RelayBus;
    use livecall_core::config::RoomConfig;
    use livecall_core::service::{Collaborators, RoomDirectory, SnowflakeIdGenerator, StatCollector};
    use livecall_core::{KeyBuilder, LocalCache, SharedCache};
    use livecall_sfu::{MemoryTransport, SessionConfig};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_router() -> Router {
        let cache: Arc<dyn SharedCache> = Arc::new(LocalCache::new());
        let keys = KeyBuilder::default();
        let bus = Arc::new(RelayBus::new(cache.clone(), keys.clone(), "node-test"));
        let directory = Arc::new(
            RoomDirectory::new(cache, keys, Arc::new(SnowflakeIdGenerator::new(1)), RoomConfig::default())
                .with_events(bus.clone()),
        );
        let rtc = RtcService::new(
            Arc::new(MemoryTransport::new()),
            directory.clone(),
            bus,
            StatCollector::disabled(),
            SessionConfig {
                subscribe_timeout: Duration::from_millis(200),
                ..SessionConfig::default()
            },
        );
        rtc.start().await.unwrap();
        let logic = Arc::new(RoomLogic::new(directory, Collaborators::default(), 60));
        create_router(logic, rtc)
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = router.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    async fn create(router: &Router, uid: i64, mode: i32) -> String {
        let (status, room) = send(router, Method::POST, "/room", Some(json!({"u_id": uid, "mode": mode}))).await;
        assert_eq!(status, StatusCode::CREATED);
        room["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let router = test_router().await;
        let (status, body) = send(&router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("OK".to_string()));
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let router = test_router().await;
        let room_id = create(&router, 1, 3).await;

        let (status, room) = send(&router, Method::GET, &format!("/room/{room_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(room["owner_id"], 1);
        assert_eq!(room["mode"], 3);

        let (status, _) = send(&router, Method::POST, "/room/join", Some(json!({"u_id": 2, "room_id": room_id}))).await;
        assert_eq!(status, StatusCode::OK);

        let call = json!({"u_id": 1, "room_id": room_id, "members": [2], "msg": "hi"});
        let (status, _) = send(&router, Method::POST, "/room/call", Some(call)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let kick = json!({"u_id": 2, "room_id": room_id, "kickoff_u_ids": [1]});
        let (status, body) = send(&router, Method::POST, "/room/kick", Some(kick)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["status"], 403);

        let (status, _) = send(&router, Method::DELETE, "/room", Some(json!({"u_id": 1, "room_id": room_id}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&router, Method::GET, &format!("/room/{room_id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_invalid_mode_is_bad_request() {
        let router = test_router().await;
        let (status, _) = send(&router, Method::POST, "/room", Some(json!({"u_id": 1, "mode": 9}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_publish_and_play() {
        let router = test_router().await;
        let room_id = create(&router, 1, 2).await;

        let publish = json!({"room_id": room_id, "u_id": 1, "offer_sdp": STANDARD.encode("offer-1")});
        let (status, body) = send(&router, Method::POST, "/stream/publish", Some(publish)).await;
        assert_eq!(status, StatusCode::OK);
        let answer = STANDARD.decode(body["answer_sdp"].as_str().unwrap()).unwrap();
        assert_eq!(answer, b"answer:offer-1");
        let stream_key = body["stream_key"].as_str().unwrap().to_string();
        assert!(stream_key.starts_with(&format!("/stream/{room_id}/1/")));

        // the Pusher has not connected yet, so nothing is registered to play from
        let play = json!({
            "room_id": room_id,
            "u_id": 2,
            "offer_sdp": STANDARD.encode("offer-2"),
            "stream_key": stream_key,
        });
        let (status, _) = send(&router, Method::POST, "/stream/play", Some(play)).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_publish_rejects_bad_offer() {
        let router = test_router().await;
        let room_id = create(&router, 1, 2).await;
        let publish = json!({"room_id": room_id, "u_id": 1, "offer_sdp": "not base64!"});
        let (status, _) = send(&router, Method::POST, "/stream/publish", Some(publish)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = json!({"room_id": "nope", "u_id": 1, "offer_sdp": STANDARD.encode("o")});
        let (status, _) = send(&router, Method::POST, "/stream/publish", Some(missing)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
