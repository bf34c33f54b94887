pub mod error;
pub mod http;
pub mod state;
pub mod ws;

use axum::{Router, routing::get};
use state::AppState;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let rooms = Router::new()
        .route("/stats", get(http::stats::rooms_stats))
        .route("/{session_id}/stats", get(http::stats::room_stats));

    Router::new()
        .route("/healthz", get(health_check))
        .route("/ws", get(ws::handler::ws_upgrade))
        .nest("/rooms", rooms)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
