// Room management HTTP handlers
//
// The caller identity is the `u_id` body field.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use livecall_core::models::{MediaParams, Room, RoomMode};
use livecall_sfu::TransportFactory;
use serde::Deserialize;

use super::{AppResult, AppState};

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub u_id: i64,
    pub mode: i32,
    #[serde(default)]
    pub media_params: Option<MediaParams>,
}

#[derive(Debug, Deserialize)]
pub struct JoinRoomRequest {
    pub u_id: i64,
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    pub u_id: i64,
    pub room_id: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub members: Vec<i64>,
    /// Seconds; zero uses the configured call timeout
    #[serde(default)]
    pub duration: i64,
}

#[derive(Debug, Deserialize)]
pub struct CancelCallRequest {
    pub room_id: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub members: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    pub u_id: i64,
    pub room_id: String,
    #[serde(default)]
    pub invite_u_ids: Vec<i64>,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub duration: i64,
}

/// Body shared by refuse and leave
#[derive(Debug, Deserialize)]
pub struct MemberMessageRequest {
    pub u_id: i64,
    pub room_id: String,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Deserialize)]
pub struct KickRequest {
    pub u_id: i64,
    pub room_id: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub kickoff_u_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRoomRequest {
    pub u_id: i64,
    pub room_id: String,
}

pub async fn create_room<T: TransportFactory>(
    State(state): State<AppState<T>>,
    Json(req): Json<CreateRoomRequest>,
) -> AppResult<(StatusCode, Json<Room>)> {
    let mode = RoomMode::try_from(req.mode)?;
    let room = state.logic.create_room(req.u_id, mode, req.media_params).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

pub async fn get_room<T: TransportFactory>(
    State(state): State<AppState<T>>,
    Path(room_id): Path<String>,
) -> AppResult<Json<Room>> {
    Ok(Json(state.logic.query_room(&room_id).await?))
}

pub async fn join_room<T: TransportFactory>(
    State(state): State<AppState<T>>,
    Json(req): Json<JoinRoomRequest>,
) -> AppResult<Json<Room>> {
    Ok(Json(state.logic.join_room(req.u_id, &req.room_id).await?))
}

pub async fn call_members<T: TransportFactory>(
    State(state): State<AppState<T>>,
    Json(req): Json<CallRequest>,
) -> AppResult<StatusCode> {
    state
        .logic
        .call_members(req.u_id, &req.room_id, &req.members, &req.msg, req.duration)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_call<T: TransportFactory>(
    State(state): State<AppState<T>>,
    Json(req): Json<CancelCallRequest>,
) -> AppResult<StatusCode> {
    state.logic.cancel_call(&req.room_id, &req.members, &req.msg).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn invite_members<T: TransportFactory>(
    State(state): State<AppState<T>>,
    Json(req): Json<InviteRequest>,
) -> AppResult<StatusCode> {
    state
        .logic
        .invite_members(req.u_id, &req.room_id, &req.invite_u_ids, &req.msg, req.duration)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn refuse_join<T: TransportFactory>(
    State(state): State<AppState<T>>,
    Json(req): Json<MemberMessageRequest>,
) -> AppResult<StatusCode> {
    state.logic.refuse_join(req.u_id, &req.room_id, &req.msg).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn leave_room<T: TransportFactory>(
    State(state): State<AppState<T>>,
    Json(req): Json<MemberMessageRequest>,
) -> AppResult<StatusCode> {
    state.logic.leave_room(req.u_id, &req.room_id, &req.msg).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn kick_members<T: TransportFactory>(
    State(state): State<AppState<T>>,
    Json(req): Json<KickRequest>,
) -> AppResult<StatusCode> {
    state
        .logic
        .kick_members(req.u_id, &req.room_id, &req.kickoff_u_ids, &req.msg)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_room<T: TransportFactory>(
    State(state): State<AppState<T>>,
    Json(req): Json<DeleteRoomRequest>,
) -> AppResult<StatusCode> {
    state.logic.delete_room(req.u_id, &req.room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
