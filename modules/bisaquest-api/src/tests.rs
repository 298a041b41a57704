//! Router tests: requests go through the full axum stack against MemoryStore.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use bisaquest_common::{ChallengeItem, Environment};
use bisaquest_game::testing::MemoryStore;

use crate::{build_router, AppState};

fn app(store: MemoryStore) -> Router {
    build_router(Arc::new(AppState {
        store: Arc::new(store),
        round_size: 4,
    }))
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn market_items() -> Vec<ChallengeItem> {
    let zones = ["prutas", "utanon", "isda", "karne"];
    (0..12)
        .map(|i| ChallengeItem {
            item_id: Uuid::new_v4(),
            quest_id: "palengke".into(),
            label: format!("item-{i}"),
            correct_zone: zones[i % 4].into(),
            is_correct: true,
            round_number: 1,
            display_order: 12 - i as i32,
        })
        .collect()
}

fn world() -> MemoryStore {
    MemoryStore::new()
        .with_npcs(Environment::Village, 3)
        .with_npcs(Environment::Forest, 2)
        .with_npcs(Environment::Castle, 1)
        .with_items(market_items())
}

// --- Health ---

#[tokio::test]
async fn health_check_is_ok() {
    let response = app(world())
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// --- Submission ---

#[tokio::test]
async fn submitting_last_village_npc_unlocks_forest() {
    let player = Uuid::new_v4();
    let store = world()
        .with_completed_npc(player, "village_npc_1")
        .with_completed_npc(player, "village_npc_2");
    let app = app(store);

    let (status, body) = send(
        app.clone(),
        "POST",
        "/api/challenge/quest/submit",
        Some(json!({
            "playerId": player,
            "questId": "palengke",
            "npcId": "village_npc_3",
            "score": 5,
            "maxScore": 5,
            "passed": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["environment"]["percentage"], json!(100));
    assert_eq!(body["environment"]["unlocked_next"], json!("forest"));

    let (status, lobby) = send(app, "GET", &format!("/api/lobby/{player}/progress"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lobby["village"]["completed"], json!(true));
    assert_eq!(lobby["forest"]["locked"], json!(false));
    assert_eq!(lobby["castle"]["locked"], json!(true));
}

#[tokio::test]
async fn submission_missing_fields_is_bad_request() {
    let (status, body) = send(
        app(world()),
        "POST",
        "/api/challenge/quest/submit",
        Some(json!({"playerId": Uuid::new_v4(), "score": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn submission_for_unknown_npc_is_not_found() {
    let (status, _) = send(
        app(world()),
        "POST",
        "/api/challenge/quest/submit",
        Some(json!({
            "playerId": Uuid::new_v4(),
            "questId": "palengke",
            "npcId": "aswang",
            "score": 1,
            "maxScore": 5,
            "passed": false
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn persistence_failure_is_server_error() {
    let (status, body) = send(
        app(world().failing_writes()),
        "POST",
        "/api/challenge/quest/submit",
        Some(json!({
            "playerId": Uuid::new_v4(),
            "questId": "palengke",
            "npcId": "village_npc_1",
            "score": 5,
            "maxScore": 5,
            "passed": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("Persistence"));
}

// --- Items ---

#[tokio::test]
async fn randomized_items_give_one_per_zone() {
    let (status, body) = send(
        app(world()),
        "GET",
        "/api/challenge/quest/palengke/items?randomize=true",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 4);
    let mut zones: Vec<&str> = items.iter().map(|i| i["correct_zone"].as_str().unwrap()).collect();
    zones.sort();
    assert_eq!(zones, vec!["isda", "karne", "prutas", "utanon"]);
}

#[tokio::test]
async fn unrandomized_items_are_full_pool_in_display_order() {
    let (status, body) =
        send(app(world()), "GET", "/api/challenge/quest/palengke/items?randomize=false", None).await;
    assert_eq!(status, StatusCode::OK);
    let orders: Vec<i64> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["display_order"].as_i64().unwrap())
        .collect();
    assert_eq!(orders, (1..=12).collect::<Vec<_>>());
}

#[tokio::test]
async fn unknown_quest_has_no_items() {
    let (status, body) =
        send(app(world()), "GET", "/api/challenge/quest/wala/items?randomize=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"], json!([]));
}

#[tokio::test]
async fn zero_round_size_is_bad_request() {
    let (status, body) = send(
        app(world()),
        "GET",
        "/api/challenge/quest/palengke/items?randomize=true&roundSize=0",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("roundSize"));
}

#[tokio::test]
async fn round_size_query_overrides_config() {
    let (status, body) = send(
        app(world()),
        "GET",
        "/api/challenge/quest/palengke/items?randomize=true&roundSize=6",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 6);
}

// --- Environments ---
// --- Environments ---

#[tokio::test]
async fn environment_reports_predicate_unlocks() {
    let player = Uuid::new_v4();
    let store = world().with_player(player, json!({"village_progress": 100, "forest_progress": 40}));
    let app = app(store);

    let (status, forest) = send(app.clone(), "GET", &format!("/api/forest/{player}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(forest["unlocked"], json!(true));
    assert_eq!(forest["progress"], json!(40));

    let (_, castle) = send(app, "GET", &format!("/api/castle/{player}"), None).await;
    assert_eq!(castle["unlocked"], json!(false));
}

#[tokio::test]
async fn forest_stays_unlocked_after_village_progress_is_lowered() {
    let player = Uuid::new_v4();
    let app = app(world());

    let (status, _) = send(
        app.clone(),
        "PUT",
        &format!("/api/village/{player}/progress"),
        Some(json!({"progress": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, forest) = send(app.clone(), "GET", &format!("/api/forest/{player}"), None).await;
    assert_eq!(forest["unlocked"], json!(true));

    let (status, village) = send(
        app.clone(),
        "PUT",
        &format!("/api/village/{player}/progress"),
        Some(json!({"progress": 50})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(village["progress"], json!(50));

    let (_, forest) = send(app.clone(), "GET", &format!("/api/forest/{player}"), None).await;
    assert_eq!(forest["unlocked"], json!(true));
    let (_, lobby) = send(app, "GET", &format!("/api/lobby/{player}/progress"), None).await;
    assert_eq!(lobby["forest"]["locked"], json!(false));
    assert_eq!(lobby["castle"]["locked"], json!(true));
}

#[tokio::test]
async fn unknown_player_is_not_found() {
    let (status, _) =
        send(app(world()), "GET", &format!("/api/village/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_player_id_is_bad_request() {
    let (status, _) = send(app(world()), "GET", "/api/lobby/not-a-uuid/progress", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn progress_update_merges_into_blob() {
    let player = Uuid::new_v4();
    let store = world().with_player(
        player,
        json!({"village_npcs": {"village_npc_1": {"encounters": 1, "best_score": 5, "is_completed": true}}}),
    );
    let app = app(store);

    let (status, view) = send(
        app,
        "PUT",
        &format!("/api/village/{player}/progress"),
        Some(json!({
            "progress": 67,
            "npcs": {"village_npc_2": {"encounters": 1, "best_score": 4, "is_completed": true}}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["progress"], json!(67));
    assert_eq!(view["npcs"]["village_npc_1"]["is_completed"], json!(true));
    assert_eq!(view["npcs"]["village_npc_2"]["best_score"], json!(4));
}

#[tokio::test]
async fn progress_update_over_hundred_is_bad_request() {
    let (status, _) = send(
        app(world()),
        "PUT",
        &format!("/api/forest/{}/progress", Uuid::new_v4()),
        Some(json!({"progress": 150})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// --- Reset and history ---

#[tokio::test]
async fn reset_relocks_forest_and_keeps_history() {
    let player = Uuid::new_v4();
    let app = app(world());
    for n in 1..=3 {
        let (status, _) = send(
            app.clone(),
            "POST",
            "/api/challenge/quest/submit",
            Some(json!({
                "playerId": player,
                "questId": "palengke",
                "npcId": format!("village_npc_{n}"),
                "score": 5,
                "maxScore": 5,
                "passed": true
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, _) = send(app.clone(), "POST", &format!("/api/lobby/{player}/reset"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, lobby) = send(app.clone(), "GET", &format!("/api/lobby/{player}/progress"), None).await;
    assert_eq!(lobby["village"]["progress"], json!(0));
    assert_eq!(lobby["forest"]["locked"], json!(true));

    let (status, history) = send(
        app,
        "GET",
        &format!("/api/challenge/player/{player}/attempts?questId=palengke"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["attempts"].as_array().unwrap().len(), 3);
}
