//! Domain service enforcing the incident state machine.

use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::warn;
use uuid::Uuid;

use airside_bus_core::{EventBus, EventDraft};

use crate::{Incident, IncidentRepository, IncidentState, SocError};

/// Result of a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    /// State the incident is in after the call.
    pub new_state: IncidentState,
    /// True when the incident was already in the target state and nothing
    /// was written or emitted.
    pub idempotent: bool,
}

/// SOC domain service: validates transitions, drives the CAS-with-audit
/// write, and announces committed transitions on the bus.
#[derive(Clone)]
pub struct SocService {
    repository: Arc<dyn IncidentRepository>,
    bus: EventBus,
}

impl SocService {
    /// Assemble the service over a repository and the event bus.
    pub fn new(repository: Arc<dyn IncidentRepository>, bus: EventBus) -> Self {
        Self { repository, bus }
    }

    /// Fetch an incident by public identifier.
    pub async fn get_incident(&self, incident_id: &str) -> Result<Option<Incident>, SocError> {
        self.repository.get(incident_id).await
    }

    /// Attempt to move an incident to `to_state`.
    ///
    /// Validation order matters: an unknown target rejects before the row
    /// is even loaded, a corrupt stored state rejects before edges are
    /// checked, and an idempotent re-request short-circuits with no side
    /// effects. The event publish happens strictly after the database
    /// commit and is best-effort - the write model is the source of truth.
    pub async fn transition_incident(
        &self,
        incident_id: &str,
        to_state: &str,
        triggered_by: &str,
    ) -> Result<TransitionOutcome, SocError> {
        let to_state = to_state.trim();
        let target = IncidentState::parse(to_state)
            .ok_or_else(|| SocError::UnknownState(to_state.to_owned()))?;

        let incident = self
            .repository
            .get(incident_id)
            .await?
            .ok_or_else(|| SocError::NotFound(incident_id.to_owned()))?;

        let current = IncidentState::parse(&incident.state)
            .ok_or_else(|| SocError::CorruptState(incident.state.clone()))?;

        if target == current {
            return Ok(TransitionOutcome {
                new_state: target,
                idempotent: true,
            });
        }

        if !current.can_transition_to(target) {
            return Err(SocError::InvalidTransition {
                from: current.as_str().to_owned(),
                to: target.as_str().to_owned(),
                allowed: current
                    .allowed_next()
                    .iter()
                    .map(|s| s.as_str())
                    .collect(),
            });
        }

        let swapped = self
            .repository
            .transition_with_audit(
                incident.id,
                current.as_str(),
                target.as_str(),
                triggered_by,
            )
            .await?;
        if !swapped {
            return Err(SocError::ConcurrentModification(incident_id.to_owned()));
        }

        self.announce_transition(&incident, incident_id, current, target, triggered_by)
            .await;

        Ok(TransitionOutcome {
            new_state: target,
            idempotent: false,
        })
    }

    async fn announce_transition(
        &self,
        incident: &Incident,
        incident_id: &str,
        from: IncidentState,
        to: IncidentState,
        triggered_by: &str,
    ) {
        let correlation_id = if incident.correlation_id.is_nil() {
            Uuid::new_v4().to_string()
        } else {
            incident.correlation_id.to_string()
        };

        let mut payload = JsonMap::new();
        payload.insert(
            "incident_id".to_owned(),
            JsonValue::String(incident_id.to_owned()),
        );
        payload.insert(
            "from_state".to_owned(),
            JsonValue::String(from.as_str().to_owned()),
        );
        payload.insert(
            "to_state".to_owned(),
            JsonValue::String(to.as_str().to_owned()),
        );
        payload.insert(
            "triggered_by".to_owned(),
            JsonValue::String(triggered_by.to_owned()),
        );

        let draft = EventDraft::new("incident.state_changed", "soc")
            .correlation_id(correlation_id)
            .entity_ref("incidentId", incident_id)
            .payload(payload);

        if let Err(err) = self.bus.publish(draft).await {
            warn!(incident_id, %err, "failed to publish incident.state_changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryIncidentRepository, NewIncident};
    use airside_bus_core::{BackendKind, Cursor, EventLog};
    use airside_log_memory::MemoryLog;
    use airside_types::coerce_uuid;
    use std::time::Duration;

    async fn fixture(state: &str) -> (SocService, Arc<MemoryIncidentRepository>, MemoryLog) {
        let repo = Arc::new(MemoryIncidentRepository::new());
        repo.insert_if_absent(NewIncident {
            id: coerce_uuid("I1"),
            kind: "UNAUTHORIZED_ACCESS".to_owned(),
            severity: "critical".to_owned(),
            state: state.to_owned(),
            correlation_id: coerce_uuid("C1"),
            location: None,
        })
        .await
        .unwrap();

        let log = MemoryLog::new();
        let bus = EventBus::new(Arc::new(log.clone()), BackendKind::Memory);
        (SocService::new(repo.clone(), bus), repo, log)
    }

    #[tokio::test]
    async fn valid_transition_audits_and_announces() {
        let (service, repo, log) = fixture("New").await;

        let outcome = service
            .transition_incident("I1", "Triage", "u1")
            .await
            .unwrap();
        assert_eq!(outcome.new_state, IncidentState::Triage);
        assert!(!outcome.idempotent);

        let audit = repo.transitions(coerce_uuid("I1")).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].from_state, "New");
        assert_eq!(audit[0].to_state, "Triage");
        assert_eq!(audit[0].triggered_by, "u1");

        let entries = log
            .range("stream:events:global", &Cursor::Start, 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        let envelope = &entries[0].1;
        assert_eq!(envelope.event_type, "incident.state_changed");
        assert_eq!(envelope.correlation_id, coerce_uuid("C1").to_string());
        assert_eq!(
            envelope.entity_refs.get("incidentId").map(String::as_str),
            Some("I1")
        );
        assert_eq!(envelope.payload_str(&["to_state"]).as_deref(), Some("Triage"));
    }

    #[tokio::test]
    async fn invalid_edge_is_rejected_without_side_effects() {
        let (service, repo, log) = fixture("New").await;

        let err = service
            .transition_incident("I1", "Resolved", "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, SocError::InvalidTransition { .. }));

        assert_eq!(repo.get("I1").await.unwrap().unwrap().state, "New");
        assert!(repo.transitions(coerce_uuid("I1")).await.unwrap().is_empty());
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_target_state_rejects_before_lookup() {
        let (service, _, _) = fixture("New").await;
        let err = service
            .transition_incident("I1", "NonExistentState", "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, SocError::UnknownState(s) if s == "NonExistentState"));

        let err = service.transition_incident("I1", "   ", "u1").await.unwrap_err();
        assert!(matches!(err, SocError::UnknownState(_)));
    }

    #[tokio::test]
    async fn corrupt_stored_state_is_its_own_failure() {
        let (service, _, _) = fixture("CorruptState").await;
        let err = service
            .transition_incident("I1", "Triage", "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, SocError::CorruptState(s) if s == "CorruptState"));
    }

    #[tokio::test]
    async fn missing_incident_is_not_found() {
        let (service, _, _) = fixture("New").await;
        let err = service
            .transition_incident("I-missing", "Triage", "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, SocError::NotFound(_)));
    }

    #[tokio::test]
    async fn repeating_the_target_state_is_idempotent() {
        let (service, repo, log) = fixture("Triage").await;

        let outcome = service
            .transition_incident("I1", "Triage", "u1")
            .await
            .unwrap();
        assert!(outcome.idempotent);
        assert!(repo.transitions(coerce_uuid("I1")).await.unwrap().is_empty());
        assert!(log.is_empty().await);
    }

    /// Delegates reads but always loses the swap, the way a writer whose
    /// observation went stale between SELECT and UPDATE does.
    struct StaleRepo(Arc<MemoryIncidentRepository>);

    #[async_trait::async_trait]
    impl IncidentRepository for StaleRepo {
        async fn get(&self, public_id: &str) -> Result<Option<Incident>, SocError> {
            self.0.get(public_id).await
        }

        async fn insert_if_absent(&self, row: NewIncident) -> Result<(), SocError> {
            self.0.insert_if_absent(row).await
        }

        async fn force_state(&self, id: Uuid, to_state: &str) -> Result<(), SocError> {
            self.0.force_state(id, to_state).await
        }

        async fn transition_with_audit(
            &self,
            _id: Uuid,
            _from_state: &str,
            _to_state: &str,
            _triggered_by: &str,
        ) -> Result<bool, SocError> {
            Ok(false)
        }

        async fn transitions(
            &self,
            incident_id: Uuid,
        ) -> Result<Vec<crate::IncidentTransition>, SocError> {
            self.0.transitions(incident_id).await
        }
    }

    #[tokio::test]
    async fn lost_swap_surfaces_as_concurrent_modification() {
        let (_, repo, _) = fixture("New").await;

        // A writer whose swap lands on zero rows gets a conflict, writes no
        // audit entry and emits no event. (That exactly one of two racing
        // swaps succeeds is covered at the repository layer.)
        let log = MemoryLog::new();
        let loser = SocService::new(
            Arc::new(StaleRepo(repo.clone())),
            EventBus::new(Arc::new(log.clone()), BackendKind::Memory),
        );
        let err = loser
            .transition_incident("I1", "Triage", "u2")
            .await
            .unwrap_err();
        assert!(matches!(err, SocError::ConcurrentModification(_)));
        assert!(repo.transitions(coerce_uuid("I1")).await.unwrap().is_empty());
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn blank_correlation_gets_a_fresh_one() {
        let repo = Arc::new(MemoryIncidentRepository::new());
        repo.insert_if_absent(NewIncident {
            id: coerce_uuid("I2"),
            kind: "FIRE_ALARM".to_owned(),
            severity: "warning".to_owned(),
            state: "New".to_owned(),
            correlation_id: Uuid::nil(),
            location: None,
        })
        .await
        .unwrap();

        let log = MemoryLog::new();
        let bus = EventBus::new(Arc::new(log.clone()), BackendKind::Memory);
        let service = SocService::new(repo, bus);

        service.transition_incident("I2", "Triage", "u1").await.unwrap();

        let entry = log
            .tail("stream:events:global", &Cursor::Start, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(entry.1.correlation_id, Uuid::nil().to_string());
        assert!(!entry.1.correlation_id.is_empty());
    }
}
