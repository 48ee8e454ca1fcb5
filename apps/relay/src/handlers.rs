use axum::{extract::State, response::Json};
use serde_json::{json, Value};

use crate::AppState;

/// Liveness probe with a summary of the in-memory room state.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "activeSessions": state.registry.session_count(),
        "participants": state.registry.participant_count(),
    }))
}
