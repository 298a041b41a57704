pub mod challenge;
pub mod environment;
pub mod lobby;

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use tracing::warn;
use uuid::Uuid;

use bisaquest_common::BisaQuestError;

// --- Helpers ---

/// Map a service error to its HTTP status with an `{"error": ...}` body.
pub fn error_response(e: &BisaQuestError) -> Response {
    let status = match e {
        BisaQuestError::Validation(_) => StatusCode::BAD_REQUEST,
        BisaQuestError::NotFound(_) => StatusCode::NOT_FOUND,
        BisaQuestError::Persistence(_) | BisaQuestError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        warn!(error = %e, "Request failed");
    }
    (status, Json(serde_json::json!({"error": e.to_string()}))).into_response()
}

pub fn bad_request(message: impl Into<String>) -> Response {
    error_response(&BisaQuestError::Validation(message.into()))
}

/// Malformed or incomplete JSON bodies are validation failures.
pub fn rejection_response(rejection: JsonRejection) -> Response {
    bad_request(rejection.body_text())
}

pub fn parse_player_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| bad_request(format!("invalid player id: {raw}")))
}
