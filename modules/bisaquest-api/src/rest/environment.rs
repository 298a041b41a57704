// Per-environment progress endpoints. The same handlers serve village, forest
// and castle; `router` binds them to one environment.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use bisaquest_common::{BisaQuestError, Environment, NpcCompletion, MAX_ENCOUNTERS};
use bisaquest_game::environment_view;

use super::{error_response, parse_player_id, rejection_response};
use crate::AppState;

pub fn router(env: Environment) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/{player_id}",
            get(move |state: State<Arc<AppState>>, path: Path<String>| {
                api_environment(env, state, path)
            }),
        )
        .route(
            "/{player_id}/progress",
            put(
                move |state: State<Arc<AppState>>,
                      path: Path<String>,
                      body: Result<Json<ProgressUpdate>, JsonRejection>| {
                    api_update_progress(env, state, path, body)
                },
            ),
        )
}

/// Body of `PUT /api/<env>/{player_id}/progress`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProgressUpdate {
    pub progress: Option<u8>,
    pub npcs: Option<BTreeMap<String, NpcCompletion>>,
}

impl ProgressUpdate {
    /// Validate and turn into a blob patch for `env`.
    pub fn into_patch(self, env: Environment) -> Result<Value, BisaQuestError> {
        let mut patch = Map::new();

        if let Some(progress) = self.progress {
            if progress > 100 {
                return Err(BisaQuestError::validation("progress must be between 0 and 100"));
            }
            patch.insert(env.progress_key(), Value::from(progress));
        }

        if let Some(npcs) = self.npcs {
            let mut entries = Map::new();
            for (npc_id, completion) in npcs {
                if npc_id.trim().is_empty() {
                    return Err(BisaQuestError::validation("npc id must not be empty"));
                }
                if !(0..=MAX_ENCOUNTERS).contains(&completion.encounters) {
                    return Err(BisaQuestError::validation(format!(
                        "encounters for {npc_id} must be between 0 and {MAX_ENCOUNTERS}"
                    )));
                }
                let value = serde_json::to_value(&completion)
                    .map_err(|e| BisaQuestError::validation(e.to_string()))?;
                entries.insert(npc_id, value);
            }
            patch.insert(env.npcs_key(), Value::Object(entries));
        }

        if patch.is_empty() {
            return Err(BisaQuestError::validation("nothing to update"));
        }
        Ok(Value::Object(patch))
    }
}

pub async fn api_environment(
    env: Environment,
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
        Ok(rows) => Json(environment_view(env, &blob, &rows)).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn api_update_progress(
    env: Environment,
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
    body: Result<Json<ProgressUpdate>, JsonRejection>,
) -> Response {
    let player_id = match parse_player_id(&player_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Json(update) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection_response(rejection),
    };
    let patch = match update.into_patch(env) {
        Ok(patch) => patch,
        Err(e) => return error_response(&e),
    };

    let blob = match state.store.merge_player_progress(player_id, &patch).await {
        Ok(blob) => blob,
        Err(e) => return error_response(&e),
    };
    info!(%player_id, environment = %env, "Environment progress updated");

    match state.store.environment_rows(player_id).await {
        Ok(rows) => Json(environment_view(env, &blob, &rows)).into_response(),
        Err(e) => error_response(&e),
    }
}
