//! Error envelope and domain-error translation.
//!
//! Domain services raise typed errors; this module is the single place
//! they become HTTP. The body shape is always
//! `{"error":{"code","message","details"?}}` with `VALIDATION_ERROR`,
//! `HTTP_ERROR` or `INTERNAL_ERROR` as the code.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JsonValue};
use tracing::error;

use airside_bus_core::LogError;
use airside_soc::SocError;
use airside_ticketing::TicketError;

/// An error ready to leave the process as HTTP.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<JsonValue>,
}

impl ApiError {
    /// 422 with the `VALIDATION_ERROR` code.
    pub fn validation(message: impl Into<String>, details: Option<JsonValue>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            code: "VALIDATION_ERROR",
            message: message.into(),
            details,
        }
    }

    /// Client-visible failure with the `HTTP_ERROR` code.
    pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: "HTTP_ERROR",
            message: message.into(),
            details: None,
        }
    }

    /// 500 with the `INTERNAL_ERROR` code; the real cause goes to the log,
    /// not the client.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: message.into(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        if let Some(details) = self.details {
            body["error"]["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<SocError> for ApiError {
    fn from(err: SocError) -> Self {
        match &err {
            SocError::NotFound(_) => ApiError::http(StatusCode::NOT_FOUND, err.to_string()),
            SocError::UnknownState(_)
            | SocError::InvalidTransition { .. }
            | SocError::ConcurrentModification(_) => {
                ApiError::http(StatusCode::CONFLICT, err.to_string())
            }
            SocError::CorruptState(state) => {
                error!(%state, "incident row carries a state outside the graph");
                ApiError::internal("incident state is corrupt")
            }
            SocError::Storage(cause) => {
                error!(%cause, "incident storage failure");
                ApiError::internal("An unexpected error occurred.")
            }
        }
    }
}

impl From<TicketError> for ApiError {
    fn from(err: TicketError) -> Self {
        match &err {
            TicketError::NotFound(_) => ApiError::http(StatusCode::NOT_FOUND, err.to_string()),
            TicketError::UnknownState(_)
            | TicketError::InvalidTransition { .. }
            | TicketError::ConcurrentModification(_) => {
                ApiError::http(StatusCode::CONFLICT, err.to_string())
            }
            TicketError::InvalidArgument(_) => {
                ApiError::http(StatusCode::BAD_REQUEST, err.to_string())
            }
            TicketError::CorruptState(state) => {
                error!(%state, "ticket row carries a state outside the lifecycle");
                ApiError::internal("ticket state is corrupt")
            }
            TicketError::Storage(cause) => {
                error!(%cause, "ticket storage failure");
                ApiError::internal("An unexpected error occurred.")
            }
        }
    }
}

impl From<LogError> for ApiError {
    fn from(err: LogError) -> Self {
        match &err {
            LogError::Unavailable(_) | LogError::Transient(_) => {
                ApiError::http(StatusCode::SERVICE_UNAVAILABLE, "event log unavailable")
            }
            LogError::NotFound(_) => ApiError::http(StatusCode::NOT_FOUND, err.to_string()),
            LogError::Fatal(cause) => {
                error!(%cause, "fatal event log error");
                ApiError::internal("An unexpected error occurred.")
            }
        }
    }
}

/// `Json<T>` whose rejection uses the error envelope instead of axum's
/// plain-text default.
pub struct ApiJson<T>(
    /// The deserialized body.
    pub T,
);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    ApiError::validation(
        "Invalid request body",
        Some(json!({ "reason": rejection.body_text() })),
    )
}
