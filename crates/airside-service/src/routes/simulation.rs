//! Simulation trigger endpoints.
//!
//! Thin producers: each action publishes the canonical `fleet.*` event
//! and, for fleet actions, a paired `incident.created` under one
//! correlation id so the ops feed lights up immediately. The write model
//! picks the incident up through the normal consumer path.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use airside_bus_core::EventDraft;
use airside_types::Severity;

use crate::error::ApiError;
use crate::state::AppState;

/// POST /simulation/fleet/{action}
pub async fn trigger_fleet_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let (event_type, incident_type, severity, vehicle, zone) = match action.as_str() {
        "overspeed" => (
            "fleet.overspeed_detected",
            "FLEET_OVERSPEED",
            Severity::Warning,
            "VEH-202",
            "APRON_TRANSFER_ZONE",
        ),
        "geofence" => (
            "fleet.geofence_breached",
            "GEOFENCE_BREACH",
            Severity::Critical,
            "VEH-101",
            "AIRSIDE_PERIMETER",
        ),
        other => {
            return Err(ApiError::http(
                StatusCode::NOT_FOUND,
                format!("Fleet action '{other}' not found"),
            ))
        }
    };

    let scenario_run_id = Uuid::new_v4().to_string();
    let correlation_id = Uuid::new_v4().to_string();

    let mut common = JsonMap::new();
    common.insert("vehicleId".into(), JsonValue::String(vehicle.to_owned()));
    common.insert("zoneId".into(), JsonValue::String(zone.to_owned()));
    common.insert(
        "timestamp".into(),
        JsonValue::String(Utc::now().to_rfc3339()),
    );

    state
        .bus
        .publish(
            EventDraft::new(event_type, "simulation")
                .severity(severity)
                .correlation_id(correlation_id.clone())
                .entity_ref("scenarioRunId", scenario_run_id.clone())
                .payload(common.clone()),
        )
        .await?;

    let incident_id = Uuid::new_v4().to_string();
    let mut incident_payload = common;
    incident_payload.insert("id".into(), JsonValue::String(incident_id.clone()));
    incident_payload.insert(
        "type".into(),
        JsonValue::String(incident_type.to_owned()),
    );
    incident_payload.insert(
        "severity".into(),
        JsonValue::String(severity.as_str().to_owned()),
    );
    incident_payload.insert("state".into(), JsonValue::String("New".to_owned()));
    incident_payload.insert(
        "correlation_id".into(),
        JsonValue::String(correlation_id.clone()),
    );

    state
        .bus
        .publish(
            EventDraft::new("incident.created", "simulation")
                .severity(severity)
                .correlation_id(correlation_id)
                .entity_ref("scenarioRunId", scenario_run_id.clone())
                .payload(incident_payload),
        )
        .await?;

    Ok(Json(json!({
        "status": "triggered",
        "action": action,
        "incident_id": incident_id,
        "run_id": scenario_run_id,
    })))
}

/// POST /simulation/robot/{action}
pub async fn trigger_robot_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    if action != "patrol" {
        return Err(ApiError::http(
            StatusCode::NOT_FOUND,
            format!("Robot action '{action}' not found"),
        ));
    }

    let scenario_run_id = Uuid::new_v4().to_string();
    let mut payload = JsonMap::new();
    payload.insert("robotId".into(), JsonValue::String("ROB-01".to_owned()));
    payload.insert(
        "zoneId".into(),
        JsonValue::String("APRON_TRANSFER_ZONE".to_owned()),
    );
    payload.insert(
        "timestamp".into(),
        JsonValue::String(Utc::now().to_rfc3339()),
    );

    state
        .bus
        .publish(
            EventDraft::new("fleet.robot_patrol_started", "simulation")
                .entity_ref("scenarioRunId", scenario_run_id.clone())
                .payload(payload),
        )
        .await?;

    Ok(Json(json!({
        "status": "triggered",
        "action": "patrol",
        "run_id": scenario_run_id,
    })))
}
