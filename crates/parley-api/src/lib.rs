pub mod messages;
pub mod presence;

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};

use parley_db::Database;
use parley_gateway::Gateway;
use parley_types::api::HealthResponse;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub gateway: Gateway,
}

/// Read-only REST surface. WebSocket routes are mounted by the binary.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/users/{user_id}/presence", get(presence::get_presence))
        .route("/conversations/{a}/{b}/messages", get(messages::get_conversation))
        .route("/health", get(health))
        .with_state(state)
}

/// GET /health: liveness check plus the live session count.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        sessions: state.gateway.registry().session_count().await,
    })
}
