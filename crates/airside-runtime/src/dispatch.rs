//! Event dispatcher: routes consumed envelopes into side effects.
//!
//! The dispatcher is where at-least-once delivery meets the write model.
//! Its error contract drives acknowledgement: `Ok` means ack,
//! [`DispatchError`] means leave the entry pending so the durable backend
//! redelivers it. Poison messages - recognisably unrecoverable input like
//! fleet telemetry without an asset id - are logged and swallowed so they
//! cannot wedge a consumer group.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};
use uuid::Uuid;

use airside_soc::{IncidentRepository, NewIncident, SocError};
use airside_types::{coerce_uuid, EventEnvelope};

/// Canonical spelling of the asset status event; producers also emit
/// `fleet.asset.status_changed` and consumers treat both as synonyms.
const FLEET_ASSET_STATUS: &str = "fleet.asset_status_changed";
const FLEET_ASSET_STATUS_ALIAS: &str = "fleet.asset.status_changed";
const FLEET_ROBOT_PATROL: &str = "fleet.robot_patrol_started";

//─────────────────────────────
//  Errors
//─────────────────────────────

/// A dispatch failure; the entry stays unacknowledged.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The envelope is structurally unusable for its event type.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    /// The write model rejected the side effect.
    #[error("write model failure")]
    WriteModel(#[from] SocError),
    /// The telemetry sink failed.
    #[error("telemetry sink failure")]
    Telemetry(#[source] anyhow::Error),
}

//─────────────────────────────
//  Fleet telemetry sink
//─────────────────────────────

/// Receiver for fleet telemetry events consumed off the bus.
#[async_trait]
pub trait FleetTelemetrySink: Send + Sync {
    /// Record one telemetry observation. `event_type` is already
    /// canonicalised.
    async fn record(
        &self,
        event_type: &str,
        asset_id: &str,
        payload: &JsonMap<String, JsonValue>,
    ) -> anyhow::Result<()>;
}

/// Default sink: structured log output only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFleetSink;

#[async_trait]
impl FleetTelemetrySink for LoggingFleetSink {
    async fn record(
        &self,
        event_type: &str,
        asset_id: &str,
        _payload: &JsonMap<String, JsonValue>,
    ) -> anyhow::Result<()> {
        debug!(event_type, asset_id, "fleet telemetry observed");
        Ok(())
    }
}

//─────────────────────────────
//  Dispatcher
//─────────────────────────────

/// Routes envelopes by `event_type` into write-model updates.
pub struct Dispatcher {
    incidents: Arc<dyn IncidentRepository>,
    fleet: Arc<dyn FleetTelemetrySink>,
}

impl Dispatcher {
    /// Assemble over the incident write model and a telemetry sink.
    pub fn new(
        incidents: Arc<dyn IncidentRepository>,
        fleet: Arc<dyn FleetTelemetrySink>,
    ) -> Self {
        Self { incidents, fleet }
    }

    /// Apply the side effect for one envelope.
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> Result<(), DispatchError> {
        match envelope.event_type.trim() {
            "incident.created" => self.upsert_incident(envelope).await,
            "incident.state_changed" => self.apply_state_change(envelope).await,
            FLEET_ASSET_STATUS | FLEET_ASSET_STATUS_ALIAS => {
                self.forward_telemetry(FLEET_ASSET_STATUS, envelope).await
            }
            FLEET_ROBOT_PATROL => self.forward_telemetry(FLEET_ROBOT_PATROL, envelope).await,
            // Everything else is somebody else's concern: ack and move on.
            _ => Ok(()),
        }
    }

    async fn upsert_incident(&self, envelope: &EventEnvelope) -> Result<(), DispatchError> {
        let public_id = envelope
            .payload_str(&["id", "incidentId", "incident_id"])
            .ok_or_else(|| {
                DispatchError::InvalidMessage("incident.created without an id".to_owned())
            })?;

        let kind = envelope
            .payload_str(&["type", "incidentType"])
            .unwrap_or_else(|| "UNKNOWN".to_owned());
        let severity = envelope
            .payload_str(&["severity"])
            .unwrap_or_else(|| "info".to_owned());
        let state = envelope
            .payload_str(&["state"])
            .unwrap_or_else(|| "New".to_owned());
        let correlation = envelope
            .payload_str(&["correlation_id", "correlationId"])
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.incidents
            .insert_if_absent(NewIncident {
                id: coerce_uuid(&public_id),
                kind,
                severity,
                state,
                correlation_id: coerce_uuid(&correlation),
                location: envelope.payload.get("location").cloned(),
            })
            .await?;
        Ok(())
    }

    async fn apply_state_change(&self, envelope: &EventEnvelope) -> Result<(), DispatchError> {
        let public_id = envelope
            .payload_str(&["incident_id", "incidentId", "id"])
            .ok_or_else(|| {
                DispatchError::InvalidMessage("incident.state_changed without an id".to_owned())
            })?;
        let to_state = envelope
            .payload_str(&["to_state", "toState", "state"])
            .ok_or_else(|| {
                DispatchError::InvalidMessage(
                    "incident.state_changed without a state".to_owned(),
                )
            })?;

        self.incidents
            .force_state(coerce_uuid(&public_id), &to_state)
            .await?;
        Ok(())
    }

    async fn forward_telemetry(
        &self,
        canonical_type: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), DispatchError> {
        let Some(asset_id) =
            envelope.payload_str(&["assetId", "asset_id", "vehicleId", "robotId"])
        else {
            // Poison message: retrying will never grow an asset id. Ack.
            warn!(
                event_type = %envelope.event_type,
                event_id = %envelope.event_id,
                "fleet telemetry without an asset id, dropping"
            );
            return Ok(());
        };

        self.fleet
            .record(canonical_type, &asset_id, &envelope.payload)
            .await
            .map_err(DispatchError::Telemetry)
    }
}
