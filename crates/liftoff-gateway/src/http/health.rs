use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — liveness plus a pool summary.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let accounts = state.pool().list();
    Json(json!({
        "status": "ok",
        "accounts": accounts.len(),
        "active": accounts.iter().any(|a| a.is_active),
    }))
}
