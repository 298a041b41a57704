use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json, Response},
};
use tracing::info;

use bisaquest_common::BisaQuestError;
use bisaquest_game::lobby_view;

use super::{error_response, parse_player_id};
use crate::AppState;

/// All three environments' progress and lock state in one call.
pub async fn api_lobby_progress(
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
) -> Response {
    let player_id = match parse_player_id(&player_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let blob = match state.store.player_progress(player_id).await {
        Ok(Some(blob)) => blob,
        Ok(None) => {
            return error_response(&BisaQuestError::not_found(format!("player {player_id}")))
        }
        Err(e) => return error_response(&e),
    };

    match state.store.environment_rows(player_id).await {
        Ok(rows) => Json(lobby_view(&blob, &rows)).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn api_reset_progress(
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
) -> Response {
    let player_id = match parse_player_id(&player_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.store.reset_player(player_id).await {
        Ok(()) => {
            info!(%player_id, "Player progress reset");
            Json(serde_json::json!({ "status": "reset" })).into_response()
        }
        Err(e) => error_response(&e),
    }
}
