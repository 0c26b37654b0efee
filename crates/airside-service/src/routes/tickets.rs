//! Ticketing endpoints: create, read, transition, assign.

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use airside_ticketing::{IncidentSnapshot, Ticket};

use crate::error::{ApiError, ApiJson};
use crate::state::AppState;

//─────────────────────────────
//  Wire shapes
//─────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct TicketResponse {
    id: String,
    incident_id: String,
    status: String,
    priority: String,
    sla_deadline_utc: DateTime<Utc>,
    created_at_utc: DateTime<Utc>,
    assignee_id: Option<String>,
}

impl From<Ticket> for TicketResponse {
    fn from(ticket: Ticket) -> Self {
        Self {
            id: ticket.id.to_string(),
            incident_id: ticket.incident_id.to_string(),
            status: ticket.status,
            priority: ticket.priority,
            sla_deadline_utc: ticket.sla_deadline,
            created_at_utc: ticket.created_at,
            assignee_id: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TicketCreateRequest {
    incident_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TicketTransitionRequest {
    to_state: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TicketAssignRequest {
    assignee_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TicketTransitionResponse {
    id: String,
    status: String,
    updated_at_utc: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub(crate) struct TicketAssignResponse {
    status: &'static str,
    ticket_id: String,
    assignee_id: String,
}

//─────────────────────────────
//  Handlers
//─────────────────────────────

/// POST /tickets - direct creation from an incident identifier, reusing
/// the idempotent escalation path.
pub async fn create_ticket(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<TicketCreateRequest>,
) -> Result<Json<TicketResponse>, ApiError> {
    let correlation = Uuid::new_v4().to_string();
    let creation = state
        .tickets
        .create_from_incident(
            IncidentSnapshot::new(request.incident_id),
            Some(&correlation),
        )
        .await?;
    Ok(Json(creation.ticket.into()))
}

/// GET /tickets/{id}
pub async fn get_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TicketResponse>, ApiError> {
    let ticket = state.tickets.get_ticket(&id).await?;
    Ok(Json(ticket.into()))
}

/// POST /tickets/{id}/transition
pub async fn transition_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<TicketTransitionRequest>,
) -> Result<Json<TicketTransitionResponse>, ApiError> {
    let outcome = state
        .tickets
        .transition_ticket(&id, &request.to_state, &request.user_id, None)
        .await?;
    Ok(Json(TicketTransitionResponse {
        id,
        status: outcome.new_state.as_str().to_owned(),
        updated_at_utc: Utc::now(),
    }))
}

/// POST /tickets/{id}/assign
pub async fn assign_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<TicketAssignRequest>,
) -> Result<Json<TicketAssignResponse>, ApiError> {
    let outcome = state
        .tickets
        .assign_ticket(&id, &request.assignee_id, None)
        .await?;
    Ok(Json(TicketAssignResponse {
        status: "assigned",
        ticket_id: outcome.ticket_id.to_string(),
        assignee_id: outcome.assignee_id.to_string(),
    }))
}
