//! Top-level error categories surfaced across the room boundary.
//!
//! Every component error converts into one of these variants at the
//! boundary it owns; inner causes are captured via `#[source]` but never
//! propagate as-is past the room (spec.md §7).

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use thiserror::Error;

/// Machine-readable error codes from spec.md §6.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Room not found")]
    RoomNotFound,
    #[error("Room is closed")]
    RoomClosed,
    #[error("Room is full")]
    RoomFull,
    #[error("Invalid display name")]
    InvalidName,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not a member of this room")]
    NotInRoom,
    #[error("Not authorized")]
    Unauthorized,
    #[error("Rate limited")]
    RateLimited,
    #[error("Voice-AI provider error: {0}")]
    ProviderError(String),
    #[error("Tool call timed out")]
    ToolTimeout,
}

impl AppError {
    /// The wire `code` field from spec.md §6.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::RoomClosed => "ROOM_CLOSED",
            Self::RoomFull => "ROOM_FULL",
            Self::InvalidName => "INVALID_NAME",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::NotInRoom => "NOT_IN_ROOM",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::RateLimited => "RATE_LIMITED",
            Self::ProviderError(_) => "PROVIDER_ERROR",
            Self::ToolTimeout => "TOOL_TIMEOUT",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::RoomNotFound => StatusCode::NOT_FOUND,
            Self::RoomClosed => StatusCode::GONE,
            Self::RoomFull => StatusCode::CONFLICT,
            Self::InvalidName | Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotInRoom => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::ProviderError(_) => StatusCode::BAD_GATEWAY,
            Self::ToolTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}
