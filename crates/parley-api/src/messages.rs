use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use tracing::error;

use parley_types::models::{Message, MessageId, UserId};

use crate::AppState;

const MAX_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: only messages with an id below this one.
    pub before: Option<MessageId>,
}

fn default_limit() -> u32 {
    50
}

/// GET /conversations/{a}/{b}/messages: newest first, both directions.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path((a, b)): Path<(UserId, UserId)>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    if a == b {
        return Err(StatusCode::BAD_REQUEST);
    }
    let limit = query.limit.clamp(1, MAX_LIMIT);

    let delivery = state.gateway.delivery().clone();
    let messages = tokio::task::spawn_blocking(move || delivery.conversation(a, b, limit, query.before))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("Conversation {}/{} lookup failed: {}", a, b, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(messages))
}
