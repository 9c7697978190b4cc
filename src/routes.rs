//! Read-only operational endpoints.

use axum::{Json, extract::State};
use chrono::Utc;
use serde_json::{Value, json};

use crate::AppState;

/// Liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Sanitized snapshot of every installed instance. Token values never
/// appear here, only their count.
pub async fn debug_view(State(state): State<AppState>) -> Json<Value> {
    let mut instances = serde_json::Map::new();
    for snapshot in state.registry.snapshot() {
        let name = snapshot.name.clone();
        instances.insert(
            name,
            serde_json::to_value(&snapshot).unwrap_or(Value::Null),
        );
    }

    Json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "instances": instances,
    }))
}
