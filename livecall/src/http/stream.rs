// Publish and play HTTP handlers
//
// SDP offers and answers travel base64-encoded (standard alphabet).

use axum::{extract::State, Json};
use base64::{engine::general_purpose::STANDARD, Engine};
use livecall_sfu::TransportFactory;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub room_id: String,
    pub u_id: i64,
    pub offer_sdp: String,
}

#[derive(Debug, Deserialize)]
pub struct PlayRequest {
    pub room_id: String,
    pub u_id: i64,
    pub offer_sdp: String,
    pub stream_key: String,
}

/// Answer to a publish or play; `stream_key` is the subscriber key for plays.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamResponse {
    pub answer_sdp: String,
    pub stream_key: String,
}

fn decode_offer(offer_sdp: &str) -> AppResult<String> {
    let bytes = STANDARD
        .decode(offer_sdp.trim())
        .map_err(|_| AppError::bad_request("offer_sdp is not valid base64"))?;
    String::from_utf8(bytes).map_err(|_| AppError::bad_request("offer_sdp is not valid UTF-8"))
}

pub async fn publish<T: TransportFactory>(
    State(state): State<AppState<T>>,
    Json(req): Json<PublishRequest>,
) -> AppResult<Json<StreamResponse>> {
    let offer = decode_offer(&req.offer_sdp)?;
    let published = state.rtc.request_publish(&req.room_id, req.u_id, &offer).await?;
    tracing::debug!(room_id = %req.room_id, uid = req.u_id, stream_key = %published.stream_key, "Publish answered");
    Ok(Json(StreamResponse {
        answer_sdp: STANDARD.encode(published.answer),
        stream_key: published.stream_key,
    }))
}

pub async fn play<T: TransportFactory>(
    State(state): State<AppState<T>>,
    Json(req): Json<PlayRequest>,
) -> AppResult<Json<StreamResponse>> {
    let offer = decode_offer(&req.offer_sdp)?;
    let played = state
        .rtc
        .request_play(&req.room_id, req.u_id, &req.stream_key, &offer)
        .await?;
    tracing::debug!(room_id = %req.room_id, uid = req.u_id, subscriber_key = %played.subscriber_key, "Play answered");
    Ok(Json(StreamResponse {
        answer_sdp: STANDARD.encode(played.answer),
        stream_key: played.subscriber_key,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_offer() {
        let encoded = STANDARD.encode("v=0\r\n");
        assert_eq!(decode_offer(&encoded).unwrap(), "v=0\r\n");
        assert_eq!(decode_offer("%%%").unwrap_err().status, axum::http::StatusCode::BAD_REQUEST);
        let not_utf8 = STANDARD.encode([0xff, 0xfe]);
        assert!(decode_offer(&not_utf8).is_err());
    }
}
