use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::error;

use parley_types::api::PresenceResponse;
use parley_types::models::UserId;

use crate::AppState;

/// GET /users/{user_id}/presence
pub async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<PresenceResponse>, StatusCode> {
    let presence = state.gateway.presence().clone();
    let snapshot = tokio::task::spawn_blocking(move || presence.query(user_id))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("Presence lookup for {} failed: {}", user_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(PresenceResponse::from(snapshot)))
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn known_user_starts_offline() {
        let state = state();
        let id = state.db.create_user("UserA", "100").unwrap();

        let (status, body) = get_json(state, &format!("/users/{}/presence", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_id"], id);
        assert_eq!(body["is_online"], false);
        assert!(body["last_seen"].is_null());
    }

    #[tokio::test]
    async fn reflects_online_sessions() {
        let state = state();
        let id = state.db.create_user("UserA", "100").unwrap();
        state.gateway.presence().session_opened(id).unwrap();

        let (_, body) = get_json(state, &format!("/users/{}/presence", id)).await;
        assert_eq!(body["is_online"], true);
    }

    #[tokio::test]
    async fn unknown_user_is_404() {
        let (status, _) = get_json(state(), "/users/77/presence").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
