#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **airside-service** – HTTP surface of the airside operations backend.
//!
//! One axum application: the long-lived Server-Sent Events push channel
//! operator consoles hang off, the cursored event history for late
//! joiners, the SOC incident and ticket APIs, and the simulation trigger
//! endpoints that feed the backbone. Every response carries an
//! `X-Request-Id`, and every error body uses the
//! `{error:{code,message,details?}}` envelope.

pub mod error;
pub mod settings;
pub mod state;

mod routes;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use uuid::Uuid;

use crate::state::AppState;

/// Build the application router over an assembled [`AppState`].
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/events", get(routes::events::list_events))
        .route("/stream/ops", get(routes::events::stream_ops))
        .route("/incidents/:id", get(routes::incidents::get_incident))
        .route(
            "/incidents/:id/transition",
            post(routes::incidents::transition_incident),
        )
        .route(
            "/incidents/:id/escalate",
            post(routes::incidents::escalate_incident),
        )
        .route("/tickets", post(routes::tickets::create_ticket))
        .route("/tickets/:id", get(routes::tickets::get_ticket))
        .route(
            "/tickets/:id/transition",
            post(routes::tickets::transition_ticket),
        )
        .route("/tickets/:id/assign", post(routes::tickets::assign_ticket))
        .route(
            "/simulation/fleet/:action",
            post(routes::simulation::trigger_fleet_action),
        )
        .route(
            "/simulation/robot/:action",
            post(routes::simulation::trigger_robot_action),
        )
        .fallback(routes::not_found)
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

/// Echo the inbound `X-Request-Id` or mint one, on every response.
async fn request_id(request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
