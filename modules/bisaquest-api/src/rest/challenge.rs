use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;

use bisaquest_game::{ordered_pool, select_round_items, submit_quest_attempt, SubmitAttempt};

use super::{bad_request, error_response, parse_player_id, rejection_response};
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsQuery {
    randomize: Option<bool>,
    round_size: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptsQuery {
    quest_id: Option<String>,
}

pub async fn api_submit_attempt(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SubmitAttempt>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection_response(rejection),
    };

    match submit_quest_attempt(state.store.as_ref(), request).await {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `randomize=true` returns one playable round; otherwise the whole pool in authored order.
pub async fn api_quest_items(
    State(state): State<Arc<AppState>>,
    Path(quest_id): Path<String>,
    Query(params): Query<ItemsQuery>,
) -> Response {
    let round_size = params.round_size.unwrap_or(state.round_size);
    if round_size == 0 {
        return bad_request("roundSize must be at least 1");
    }

    let items = match state.store.challenge_items(&quest_id).await {
        Ok(items) => items,
        Err(e) => return error_response(&e),
    };

    let items = if params.randomize.unwrap_or(false) {
        select_round_items(&items, round_size, &mut rand::rng())
    } else {
        ordered_pool(items)
    };

    Json(serde_json::json!({ "items": items })).into_response()
}

pub async fn api_player_attempts(
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
    Query(params): Query<AttemptsQuery>,
) -> Response {
    let player_id = match parse_player_id(&player_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.store.attempts(player_id, params.quest_id.as_deref()).await {
        Ok(attempts) => Json(serde_json::json!({ "attempts": attempts })).into_response(),
        Err(e) => error_response(&e),
    }
}
