use std::sync::Arc;

use anyhow::Result;
use axum::{
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bisaquest_common::{Config, Environment};
use bisaquest_game::{GameStore, PgGameStore};

mod rest;
#[cfg(test)]
mod tests;

pub struct AppState {
    pub store: Arc<dyn GameStore>,
    pub round_size: usize,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/", get(|| async { "ok" }))
        // Challenges
        .route("/api/challenge/quest/submit", post(rest::challenge::api_submit_attempt))
        .route("/api/challenge/quest/{quest_id}/items", get(rest::challenge::api_quest_items))
        .route(
            "/api/challenge/player/{player_id}/attempts",
            get(rest::challenge::api_player_attempts),
        )
        // Environments
        .nest("/api/village", rest::environment::router(Environment::Village))
        .nest("/api/forest", rest::environment::router(Environment::Forest))
        .nest("/api/castle", rest::environment::router(Environment::Castle))
        // Lobby
        .route("/api/lobby/{player_id}/progress", get(rest::lobby::api_lobby_progress))
        .route("/api/lobby/{player_id}/reset", post(rest::lobby::api_reset_progress))
        .with_state(state)
        // CORS
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        // Progress is per-player and changes on every submission
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        // Logging layer: method + path + status + latency
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                }),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bisaquest=info".parse()?))
        .init();

    let config = Config::from_env()?;

    let store = PgGameStore::connect(&config.database_url, config.database_max_connections).await?;
    store.migrate().await?;

    let host = std::env::var("API_HOST").unwrap_or_else(|_| config.web_host.clone());
    let port = std::env::var("API_PORT").unwrap_or_else(|_| config.web_port.to_string());

    let state = Arc::new(AppState {
        store: Arc::new(store),
        round_size: config.round_size,
    });

    let app = build_router(state);

    let addr = format!("{host}:{port}");
    info!("BisaQuest API starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
