//! Liveness endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value as JsonValue};

use airside_bus_core::BackendKind;

use crate::state::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<JsonValue> {
    let backend = match state.bus.backend() {
        BackendKind::Memory => "memory",
        BackendKind::Durable => "durable",
    };
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "event_backend": backend,
    }))
}
