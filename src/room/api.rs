#![forbid(unsafe_code)]

// HTTP room API - thin create/lookup/pre-registration layer over the room
// registry. Unlike the socket events, these handlers do surface NotFound
// and validation failures to their caller.

use crate::signaling::protocol::MAX_USERNAME_LEN;
use crate::signaling::SignalingServer;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum ApiError {
    NotFound,
    Validation(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Room not found"),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: String,
    pub participants: Vec<String>,
}

#[derive(Deserialize)]
pub struct JoinRequest {
    pub username: String,
}

#[derive(Serialize)]
pub struct JoinResponse {
    pub participants: Vec<String>,
}

/// POST /api/rooms
pub async fn create_room(
    State(server): State<SignalingServer>,
) -> (StatusCode, Json<CreateRoomResponse>) {
    let room_id = server.rooms().create_room();
    (StatusCode::CREATED, Json(CreateRoomResponse { room_id }))
}

/// GET /api/rooms/{room_id}
pub async fn get_room(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomInfo>, ApiError> {
    let participants = server
        .rooms()
        .participants(&room_id)
        .await
        .ok_or(ApiError::NotFound)?;
    Ok(Json(RoomInfo { room_id, participants }))
}

/// POST /api/rooms/{room_id}/join
///
/// Membership pre-registration: puts the name on the roster before the
/// socket-level join, converging on the same room state.
pub async fn join_room(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(ApiError::Validation("Username is required"));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(ApiError::Validation("Username too long"));
    }

    let participants = server
        .rooms()
        .register_participant(&room_id, username)
        .await
        .ok_or(ApiError::NotFound)?;
    Ok(Json(JoinResponse { participants }))
}
