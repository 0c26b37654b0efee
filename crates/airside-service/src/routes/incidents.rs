//! SOC incident endpoints: read, transition, escalate.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use airside_soc::Incident;
use airside_ticketing::IncidentSnapshot;

use crate::error::{ApiError, ApiJson};
use crate::state::AppState;

//─────────────────────────────
//  Wire shapes
//─────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct IncidentResponse {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    severity: String,
    state: String,
    created_at_utc: DateTime<Utc>,
    correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<JsonValue>,
}

impl From<Incident> for IncidentResponse {
    fn from(incident: Incident) -> Self {
        Self {
            id: incident.id.to_string(),
            kind: incident.kind,
            severity: incident.severity,
            state: incident.state,
            created_at_utc: incident.created_at,
            correlation_id: incident.correlation_id.to_string(),
            location: incident.location,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TransitionRequest {
    to_state: String,
    triggered_by: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EscalateRequest {
    triggered_by: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TransitionResponse {
    id: String,
    state: String,
    updated_at_utc: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub(crate) struct EscalationResponse {
    status: &'static str,
    incident_id: String,
    ticket_id: String,
    ticket_status: &'static str,
}

//─────────────────────────────
//  Handlers
//─────────────────────────────

/// GET /incidents/{id}
pub async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IncidentResponse>, ApiError> {
    let incident = state
        .soc
        .get_incident(&id)
        .await?
        .ok_or_else(|| ApiError::http(StatusCode::NOT_FOUND, format!("Incident {id} not found")))?;
    Ok(Json(incident.into()))
}

/// POST /incidents/{id}/transition
pub async fn transition_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<TransitionRequest>,
) -> Result<Json<TransitionResponse>, ApiError> {
    require_id(&id)?;
    let outcome = state
        .soc
        .transition_incident(&id, &request.to_state, &request.triggered_by)
        .await?;
    Ok(Json(TransitionResponse {
        id,
        state: outcome.new_state.as_str().to_owned(),
        updated_at_utc: Utc::now(),
    }))
}

/// POST /incidents/{id}/escalate
///
/// Escalation is a transition into `Escalated` plus the idempotent ticket
/// creation keyed on the incident. Repeating the call is safe end to end:
/// the transition short-circuits and the same ticket comes back.
pub async fn escalate_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<EscalateRequest>,
) -> Result<Json<EscalationResponse>, ApiError> {
    require_id(&id)?;
    state
        .soc
        .transition_incident(&id, "Escalated", &request.triggered_by)
        .await?;

    let incident = state
        .soc
        .get_incident(&id)
        .await?
        .ok_or_else(|| {
            ApiError::http(StatusCode::NOT_FOUND, "Incident lost during escalation")
        })?;

    let snapshot = IncidentSnapshot {
        public_id: id.clone(),
        severity: Some(incident.severity.clone()),
        correlation_id: Some(incident.correlation_id.to_string()),
    };
    let creation = state
        .tickets
        .create_from_incident(snapshot, Some(&incident.correlation_id.to_string()))
        .await?;

    Ok(Json(EscalationResponse {
        status: "escalated",
        incident_id: id,
        ticket_id: creation.ticket.id.to_string(),
        ticket_status: creation.outcome.as_str(),
    }))
}

/// Public identifiers are free-form, but blank ones are a client bug.
fn require_id(id: &str) -> Result<(), ApiError> {
    if id.trim().is_empty() {
        return Err(ApiError::http(
            StatusCode::BAD_REQUEST,
            "Invalid incident identifier",
        ));
    }
    Ok(())
}
