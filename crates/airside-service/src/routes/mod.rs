//! Route handlers, grouped by context.

pub mod events;
pub mod health;
pub mod incidents;
pub mod simulation;
pub mod tickets;

use axum::http::StatusCode;

use crate::error::ApiError;

/// Unmatched routes answer with the error envelope too.
pub async fn not_found() -> ApiError {
    ApiError::http(StatusCode::NOT_FOUND, "no such route")
}
