use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::error;

use crate::models::{Room, RoomMode};
use crate::{Error, Result};

/// Permission collaborator; any non-`Ok` answer blocks the action.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckApi: Send + Sync {
    async fn check_create_room(&self, uid: i64, mode: RoomMode) -> Result<()>;

    async fn check_join_room(&self, uid: i64, room: &Room) -> Result<()>;

    async fn check_invite(&self, uid: i64, room: &Room, invitees: &[i64]) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct CreateRoomCheck {
    uid: i64,
    room_type: i32,
}

#[derive(Debug, Serialize)]
struct JoinRoomCheck<'a> {
    uid: i64,
    room_id: &'a str,
    room_type: i32,
}

#[derive(Debug, Serialize)]
struct InviteCheck<'a> {
    request_uid: i64,
    room_id: &'a str,
    room_type: i32,
    invite_uids: &'a [i64],
}

/// Posts JSON to `{endpoint}/live_call/check/{action}`; only 200 passes.
pub struct HttpCheckApi {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCheckApi {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: super::http_client(timeout)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, action: &str, body: &impl Serialize) -> Result<()> {
        let url = format!("{}/live_call/check/{action}", self.endpoint);
        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            error!(url = %url, error = %e, "Check request failed");
            Error::Http(e)
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::OK {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        error!(url = %url, status = %status, detail = %detail, "Check rejected");
        Err(Error::PermissionDenied(if detail.is_empty() {
            format!("{action} rejected with {status}")
        } else {
            detail
        }))
    }
}

#[async_trait]
impl CheckApi for HttpCheckApi {
    async fn check_create_room(&self, uid: i64, mode: RoomMode) -> Result<()> {
        self.post(
            "create_room",
            &CreateRoomCheck {
                uid,
                room_type: mode.code(),
            },
        )
        .await
    }

    async fn check_join_room(&self, uid: i64, room: &Room) -> Result<()> {
        self.post(
            "join_room",
            &JoinRoomCheck {
                uid,
                room_id: &room.id,
                room_type: room.mode.code(),
            },
        )
        .await
    }

    async fn check_invite(&self, uid: i64, room: &Room, invitees: &[i64]) -> Result<()> {
        self.post(
            "invite",
            &InviteCheck {
                request_uid: uid,
                room_id: &room.id,
                room_type: room.mode.code(),
                invite_uids: invitees,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn room() -> Room {
        Room {
            id: "r1".to_string(),
            mode: RoomMode::Video,
            owner_id: 1,
            create_time: 0,
            media_params: None,
            participants: vec![],
        }
    }

    #[tokio::test]
    async fn test_ok_status_passes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/live_call/check/create_room"))
            .and(body_json(serde_json::json!({"uid": 5, "room_type": 3})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let api = HttpCheckApi::new(&server.uri(), Duration::from_secs(2)).unwrap();
        api.check_create_room(5, RoomMode::Video).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_is_permission_denied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/live_call/check/join_room"))
            .respond_with(ResponseTemplate::new(403).set_body_string("blocked"))
            .mount(&server)
            .await;

        let api = HttpCheckApi::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let err = api.check_join_room(2, &room()).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(ref msg) if msg == "blocked"));
    }

    #[tokio::test]
    async fn test_invite_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/live_call/check/invite"))
            .and(body_json(serde_json::json!({
                "request_uid": 1, "room_id": "r1", "room_type": 3, "invite_uids": [7, 8]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let api = HttpCheckApi::new(&format!("{}/", server.uri()), Duration::from_secs(2)).unwrap();
        api.check_invite(1, &room(), &[7, 8]).await.unwrap();
    }
}
