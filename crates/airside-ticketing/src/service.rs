//! Domain service for the ticket lifecycle.

use std::sync::Arc;

use anyhow::anyhow;
use chrono::{Duration, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::warn;
use uuid::Uuid;

use airside_bus_core::{EventBus, EventDraft};
use airside_types::{coerce_uuid, Severity};

use crate::{
    priority_for, sla_hours, NewTicket, Ticket, TicketError, TicketRepository, TicketState,
};

//─────────────────────────────
//  Inputs and outcomes
//─────────────────────────────

/// The slice of an incident the ticketing context needs.
///
/// The SOC row type stays on its side of the boundary; escalation hands
/// over the public identifier plus the severity and correlation snapshot.
#[derive(Debug, Clone, Default)]
pub struct IncidentSnapshot {
    /// Public incident identifier as carried in events.
    pub public_id: String,
    /// Severity at escalation time; absent means `info`.
    pub severity: Option<String>,
    /// The incident's correlation id, when known.
    pub correlation_id: Option<String>,
}

impl IncidentSnapshot {
    /// Snapshot with only the public identifier (direct ticket creation).
    pub fn new(public_id: impl Into<String>) -> Self {
        Self {
            public_id: public_id.into(),
            ..Self::default()
        }
    }
}

/// Whether `create_from_incident` created or found the ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationOutcome {
    /// A new ticket row was inserted and `ticket.created` emitted.
    Created,
    /// The incident already owned a ticket; nothing was written.
    Exists,
}

impl CreationOutcome {
    /// Wire representation used in API responses.
    pub fn as_str(self) -> &'static str {
        match self {
            CreationOutcome::Created => "created",
            CreationOutcome::Exists => "exists",
        }
    }
}

/// Result of an idempotent create.
#[derive(Debug, Clone)]
pub struct TicketCreation {
    /// Created or pre-existing.
    pub outcome: CreationOutcome,
    /// The ticket owning the incident after the call.
    pub ticket: Ticket,
    /// Public incident identifier echoed back.
    pub incident_public_id: String,
}

/// Result of a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketTransitionOutcome {
    /// Status after the call.
    pub new_state: TicketState,
    /// True when the ticket was already in the target status.
    pub idempotent: bool,
}

//─────────────────────────────
//  Service
//─────────────────────────────

/// Ticketing domain service: SLA computation, idempotent escalation,
/// lifecycle transitions and assignments.
#[derive(Clone)]
pub struct TicketService {
    repository: Arc<dyn TicketRepository>,
    bus: EventBus,
}

impl TicketService {
    /// Assemble the service over a repository and the event bus.
    pub fn new(repository: Arc<dyn TicketRepository>, bus: EventBus) -> Self {
        Self { repository, bus }
    }

    /// Fetch a ticket by public identifier.
    pub async fn get_ticket(&self, ticket_id: &str) -> Result<Ticket, TicketError> {
        self.repository
            .get(ticket_id)
            .await?
            .ok_or_else(|| TicketError::NotFound(ticket_id.to_owned()))
    }

    /// Idempotent creation of the ticket owned by an incident.
    ///
    /// At most one ticket per incident survives any interleaving: the
    /// lookup catches the common case, the uniqueness guard on insert
    /// catches the SELECT→INSERT race, and a lost race re-reads and
    /// collapses into the `exists` branch.
    pub async fn create_from_incident(
        &self,
        incident: IncidentSnapshot,
        correlation_id: Option<&str>,
    ) -> Result<TicketCreation, TicketError> {
        let incident_public_id = incident.public_id.trim().to_owned();
        if incident_public_id.is_empty() {
            return Err(TicketError::InvalidArgument(
                "incident id missing".to_owned(),
            ));
        }
        let incident_db_id = coerce_uuid(&incident_public_id);

        let correlation_id = correlation_id
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_owned)
            .or_else(|| {
                incident
                    .correlation_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(existing) = self.repository.get_by_incident(incident_db_id).await? {
            return Ok(TicketCreation {
                outcome: CreationOutcome::Exists,
                ticket: existing,
                incident_public_id,
            });
        }

        let severity = Severity::parse_lossy(incident.severity.as_deref().unwrap_or("info"));
        let sla_deadline = Utc::now() + Duration::hours(sla_hours(severity));
        let ticket_id = Uuid::new_v4();

        let inserted = self
            .repository
            .create_if_absent(NewTicket {
                id: ticket_id,
                incident_id: incident_db_id,
                status: TicketState::Open.as_str().to_owned(),
                priority: priority_for(severity).to_owned(),
                sla_deadline,
            })
            .await?;

        let ticket = self
            .repository
            .get_by_incident(incident_db_id)
            .await?
            .ok_or_else(|| {
                TicketError::Storage(anyhow!(
                    "ticket for incident {incident_db_id} vanished after insert"
                ))
            })?;

        if !inserted {
            // Lost the race between lookup and insert; the winner's row is
            // the answer.
            return Ok(TicketCreation {
                outcome: CreationOutcome::Exists,
                ticket,
                incident_public_id,
            });
        }

        self.announce_created(&ticket, &incident_public_id, severity, &correlation_id)
            .await;

        Ok(TicketCreation {
            outcome: CreationOutcome::Created,
            ticket,
            incident_public_id,
        })
    }

    /// Move a ticket along the lifecycle.
    pub async fn transition_ticket(
        &self,
        ticket_id: &str,
        to_state: &str,
        user_id: &str,
        correlation_id: Option<&str>,
    ) -> Result<TicketTransitionOutcome, TicketError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(TicketError::InvalidArgument(
                "user_id required for transition".to_owned(),
            ));
        }

        let to_state = to_state.trim();
        let target = TicketState::parse(to_state)
            .ok_or_else(|| TicketError::UnknownState(to_state.to_owned()))?;

        let ticket = self.get_ticket(ticket_id).await?;
        let current = TicketState::parse(&ticket.status)
            .ok_or_else(|| TicketError::CorruptState(ticket.status.clone()))?;

        if target == current {
            return Ok(TicketTransitionOutcome {
                new_state: target,
                idempotent: true,
            });
        }

        if !current.can_transition_to(target) {
            return Err(TicketError::InvalidTransition {
                from: current.as_str().to_owned(),
                to: target.as_str().to_owned(),
                allowed: current.allowed_next().iter().map(|s| s.as_str()).collect(),
            });
        }

        let swapped = self
            .repository
            .transition_status(ticket.id, current.as_str(), target.as_str())
            .await?;
        if !swapped {
            return Err(TicketError::ConcurrentModification(ticket_id.to_owned()));
        }

        let mut payload = JsonMap::new();
        payload.insert("ticket_id".into(), JsonValue::String(ticket.id.to_string()));
        payload.insert(
            "from_state".into(),
            JsonValue::String(current.as_str().to_owned()),
        );
        payload.insert(
            "to_state".into(),
            JsonValue::String(target.as_str().to_owned()),
        );
        payload.insert("user_id".into(), JsonValue::String(user_id.to_owned()));
        payload.insert(
            "status".into(),
            JsonValue::String(target.as_str().to_owned()),
        );
        payload.insert(
            "incident_db_id".into(),
            JsonValue::String(ticket.incident_id.to_string()),
        );

        let draft = EventDraft::new("ticket.state_changed", "ticketing")
            .correlation_id(correlation_id.unwrap_or_default())
            .entity_ref("ticketId", ticket.id.to_string())
            .entity_ref("incidentDbId", ticket.incident_id.to_string())
            .payload(payload);
        if let Err(err) = self.bus.publish(draft).await {
            warn!(ticket_id, %err, "failed to publish ticket.state_changed");
        }

        Ok(TicketTransitionOutcome {
            new_state: target,
            idempotent: false,
        })
    }

    /// Assign a ticket to an operator.
    pub async fn assign_ticket(
        &self,
        ticket_id: &str,
        assignee_id: &str,
        correlation_id: Option<&str>,
    ) -> Result<TicketAssignmentOutcome, TicketError> {
        let assignee_id = assignee_id.trim();
        if assignee_id.is_empty() {
            return Err(TicketError::InvalidArgument(
                "assignee_id required".to_owned(),
            ));
        }

        let ticket = self.get_ticket(ticket_id).await?;
        let assignee_db_id = coerce_uuid(assignee_id);
        self.repository
            .record_assignment(ticket.id, assignee_db_id)
            .await?;

        let mut payload = JsonMap::new();
        payload.insert("ticket_id".into(), JsonValue::String(ticket.id.to_string()));
        payload.insert(
            "assignee_id".into(),
            JsonValue::String(assignee_id.to_owned()),
        );
        payload.insert(
            "incident_db_id".into(),
            JsonValue::String(ticket.incident_id.to_string()),
        );

        let draft = EventDraft::new("ticket.assigned", "ticketing")
            .correlation_id(correlation_id.unwrap_or_default())
            .entity_ref("ticketId", ticket.id.to_string())
            .entity_ref("incidentDbId", ticket.incident_id.to_string())
            .payload(payload);
        if let Err(err) = self.bus.publish(draft).await {
            warn!(ticket_id, %err, "failed to publish ticket.assigned");
        }

        Ok(TicketAssignmentOutcome {
            ticket_id: ticket.id,
            assignee_id: assignee_db_id,
        })
    }

    async fn announce_created(
        &self,
        ticket: &Ticket,
        incident_public_id: &str,
        severity: Severity,
        correlation_id: &str,
    ) {
        let mut payload = JsonMap::new();
        payload.insert("ticket_id".into(), JsonValue::String(ticket.id.to_string()));
        payload.insert(
            "incident_id".into(),
            JsonValue::String(incident_public_id.to_owned()),
        );
        payload.insert(
            "incident_db_id".into(),
            JsonValue::String(ticket.incident_id.to_string()),
        );
        payload.insert(
            "severity_snapshot".into(),
            JsonValue::String(severity.as_str().to_owned()),
        );
        payload.insert(
            "sla_deadline".into(),
            JsonValue::String(ticket.sla_deadline.to_rfc3339()),
        );
        payload.insert(
            "status".into(),
            JsonValue::String(TicketState::Open.as_str().to_owned()),
        );

        let draft = EventDraft::new("ticket.created", "ticketing")
            .correlation_id(correlation_id)
            .entity_ref("ticketId", ticket.id.to_string())
            .entity_ref("incidentId", incident_public_id)
            .entity_ref("incidentDbId", ticket.incident_id.to_string())
            .payload(payload);
        if let Err(err) = self.bus.publish(draft).await {
            warn!(ticket_id = %ticket.id, %err, "failed to publish ticket.created");
        }
    }
}

/// Result of an assignment.
#[derive(Debug, Clone, Copy)]
pub struct TicketAssignmentOutcome {
    /// The assigned ticket.
    pub ticket_id: Uuid,
    /// Assignee as stored (derived uuid).
    pub assignee_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTicketRepository;
    use airside_bus_core::{BackendKind, Cursor, EventLog};
    use airside_log_memory::MemoryLog;

    fn service() -> (TicketService, Arc<MemoryTicketRepository>, MemoryLog) {
        let repo = Arc::new(MemoryTicketRepository::new());
        let log = MemoryLog::new();
        let bus = EventBus::new(Arc::new(log.clone()), BackendKind::Memory);
        (TicketService::new(repo.clone(), bus), repo, log)
    }

    fn snapshot(severity: &str) -> IncidentSnapshot {
        IncidentSnapshot {
            public_id: "inc-1".to_owned(),
            severity: Some(severity.to_owned()),
            correlation_id: Some("corr-1".to_owned()),
        }
    }

    #[tokio::test]
    async fn critical_incident_gets_a_four_hour_deadline_in_utc() {
        let (service, _, log) = service();

        let creation = service
            .create_from_incident(snapshot("Critical"), Some("corr-1"))
            .await
            .unwrap();
        assert_eq!(creation.outcome, CreationOutcome::Created);

        let delta = creation.ticket.sla_deadline - creation.ticket.created_at;
        let drift = (delta - Duration::hours(4)).num_seconds().abs();
        assert!(drift < 5, "deadline drifted {drift}s from the 4h window");

        let entry = log
            .tail("stream:events:global", &Cursor::Start, std::time::Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let envelope = entry.1;
        assert_eq!(envelope.event_type, "ticket.created");
        assert_eq!(envelope.correlation_id, "corr-1");
        assert_eq!(
            envelope.entity_refs.get("incidentId").map(String::as_str),
            Some("inc-1")
        );
        assert_eq!(
            envelope.entity_refs.get("incidentDbId").map(String::as_str),
            Some(coerce_uuid("inc-1").to_string().as_str())
        );
        assert_eq!(
            envelope.payload_str(&["severity_snapshot"]).as_deref(),
            Some("critical")
        );
        assert_eq!(envelope.payload_str(&["status"]).as_deref(), Some("Open"));
    }

    #[tokio::test]
    async fn sla_windows_follow_severity() {
        for (severity, hours) in [("critical", 4), ("warning", 24), ("info", 72), ("bogus", 72)] {
            let (service, _, _) = service();
            let creation = service
                .create_from_incident(snapshot(severity), None)
                .await
                .unwrap();
            let delta = creation.ticket.sla_deadline - creation.ticket.created_at;
            assert!(
                (delta - Duration::hours(hours)).num_seconds().abs() < 5,
                "severity {severity} should map to {hours}h"
            );
        }
    }

    #[tokio::test]
    async fn second_escalation_returns_the_same_ticket() {
        let (service, _, log) = service();

        let first = service
            .create_from_incident(snapshot("critical"), None)
            .await
            .unwrap();
        let second = service
            .create_from_incident(snapshot("critical"), None)
            .await
            .unwrap();

        assert_eq!(first.outcome, CreationOutcome::Created);
        assert_eq!(second.outcome, CreationOutcome::Exists);
        assert_eq!(first.ticket.id, second.ticket.id);
        // Exactly one ticket.created in the history.
        assert_eq!(log.len().await, 1);
    }

    /// Pretends the incident had no ticket at lookup time even though one
    /// exists, reproducing the SELECT→INSERT race window.
    struct RacingRepo {
        inner: Arc<MemoryTicketRepository>,
        raced: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl TicketRepository for RacingRepo {
        async fn get(&self, public_id: &str) -> Result<Option<Ticket>, TicketError> {
            self.inner.get(public_id).await
        }

        async fn get_by_incident(
            &self,
            incident_id: Uuid,
        ) -> Result<Option<Ticket>, TicketError> {
            if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.get_by_incident(incident_id).await
        }

        async fn create_if_absent(&self, row: NewTicket) -> Result<bool, TicketError> {
            self.inner.create_if_absent(row).await
        }

        async fn transition_status(
            &self,
            id: Uuid,
            from: &str,
            to: &str,
        ) -> Result<bool, TicketError> {
            self.inner.transition_status(id, from, to).await
        }

        async fn record_assignment(
            &self,
            ticket_id: Uuid,
            assignee_id: Uuid,
        ) -> Result<(), TicketError> {
            self.inner.record_assignment(ticket_id, assignee_id).await
        }

        async fn assignments(
            &self,
            ticket_id: Uuid,
        ) -> Result<Vec<crate::TicketAssignment>, TicketError> {
            self.inner.assignments(ticket_id).await
        }
    }

    #[tokio::test]
    async fn losing_the_insert_race_collapses_to_exists() {
        let inner = Arc::new(MemoryTicketRepository::new());
        let winner = NewTicket {
            id: Uuid::new_v4(),
            incident_id: coerce_uuid("inc-1"),
            status: "Open".to_owned(),
            priority: "critical".to_owned(),
            sla_deadline: Utc::now() + Duration::hours(4),
        };
        let winner_id = winner.id;
        inner.create_if_absent(winner).await.unwrap();

        let log = MemoryLog::new();
        let service = TicketService::new(
            Arc::new(RacingRepo {
                inner,
                raced: std::sync::atomic::AtomicBool::new(false),
            }),
            EventBus::new(Arc::new(log.clone()), BackendKind::Memory),
        );

        let creation = service
            .create_from_incident(snapshot("critical"), None)
            .await
            .unwrap();
        assert_eq!(creation.outcome, CreationOutcome::Exists);
        assert_eq!(creation.ticket.id, winner_id);
        // The loser must not announce a creation.
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn empty_incident_id_is_rejected() {
        let (service, _, _) = service();
        let err = service
            .create_from_incident(IncidentSnapshot::new("   "), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn lifecycle_transitions_are_strict() {
        let (service, _, log) = service();
        let creation = service
            .create_from_incident(snapshot("warning"), None)
            .await
            .unwrap();
        let id = creation.ticket.id.to_string();

        let outcome = service
            .transition_ticket(&id, "InProgress", "u-1", Some("c-1"))
            .await
            .unwrap();
        assert_eq!(outcome.new_state, TicketState::InProgress);

        let err = service
            .transition_ticket(&id, "Closed", "u-1", Some("c-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidTransition { .. }));

        let err = service
            .transition_ticket(&id, "FakeState", "u-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::UnknownState(_)));

        let err = service
            .transition_ticket(&id, "Resolved", "  ", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidArgument(_)));

        // ticket.created + ticket.state_changed
        assert_eq!(log.len().await, 2);
        let entries = log
            .range("stream:events:global", &Cursor::Start, 10)
            .await
            .unwrap();
        let changed = &entries[1].1;
        assert_eq!(changed.event_type, "ticket.state_changed");
        assert_eq!(
            changed.payload_str(&["to_state"]).as_deref(),
            Some("InProgress")
        );
        assert_eq!(
            changed.entity_refs.get("incidentDbId").map(String::as_str),
            Some(coerce_uuid("inc-1").to_string().as_str())
        );
    }

    #[tokio::test]
    async fn assignment_records_and_announces() {
        let (service, repo, log) = service();
        let creation = service
            .create_from_incident(snapshot("info"), None)
            .await
            .unwrap();
        let id = creation.ticket.id.to_string();

        let outcome = service
            .assign_ticket(&id, "operator-7", None)
            .await
            .unwrap();
        assert_eq!(outcome.assignee_id, coerce_uuid("operator-7"));

        let recorded = repo.assignments(creation.ticket.id).await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].assignee_id, coerce_uuid("operator-7"));

        let entries = log
            .range("stream:events:global", &Cursor::Start, 10)
            .await
            .unwrap();
        let assigned = &entries[1].1;
        assert_eq!(assigned.event_type, "ticket.assigned");
        assert_eq!(
            assigned.payload_str(&["assignee_id"]).as_deref(),
            Some("operator-7")
        );
    }

    #[tokio::test]
    async fn missing_ticket_is_not_found() {
        let (service, _, _) = service();
        let err = service
            .transition_ticket("t-missing", "InProgress", "u-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::NotFound(_)));
    }
}
