#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **airside-soc** – Incident store and state machine.
//!
//! Incidents walk a fixed directed graph of states. Every real transition
//! is a compare-and-swap update paired with an audit row in the same
//! database transaction, and announces itself on the bus afterwards as
//! `incident.state_changed`. Transitioning into the state an incident is
//! already in is an idempotent success: no audit row, no event.

mod repository;
mod service;

pub use repository::{
    Incident, IncidentTransition, IncidentRepository, MemoryIncidentRepository,
    NewIncident, PgIncidentRepository,
};
pub use service::{SocService, TransitionOutcome};

//─────────────────────────────
//  Incident states
//─────────────────────────────

/// A node in the incident state graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum IncidentState {
    /// Freshly reported, untouched.
    New,
    /// Under operator review.
    Triage,
    /// Supporting material attached.
    EvidenceAttached,
    /// Response units dispatched.
    Dispatched,
    /// Handled; awaiting closure.
    Resolved,
    /// Terminal.
    Closed,
    /// Escalated into the ticketing flow.
    Escalated,
}

impl IncidentState {
    /// Every node in the graph.
    pub const ALL: [IncidentState; 7] = [
        IncidentState::New,
        IncidentState::Triage,
        IncidentState::EvidenceAttached,
        IncidentState::Dispatched,
        IncidentState::Resolved,
        IncidentState::Closed,
        IncidentState::Escalated,
    ];

    /// Stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentState::New => "New",
            IncidentState::Triage => "Triage",
            IncidentState::EvidenceAttached => "EvidenceAttached",
            IncidentState::Dispatched => "Dispatched",
            IncidentState::Resolved => "Resolved",
            IncidentState::Closed => "Closed",
            IncidentState::Escalated => "Escalated",
        }
    }

    /// Parse a stored or requested state. `None` for anything outside the
    /// graph, including empty strings.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "New" => Some(IncidentState::New),
            "Triage" => Some(IncidentState::Triage),
            "EvidenceAttached" => Some(IncidentState::EvidenceAttached),
            "Dispatched" => Some(IncidentState::Dispatched),
            "Resolved" => Some(IncidentState::Resolved),
            "Closed" => Some(IncidentState::Closed),
            "Escalated" => Some(IncidentState::Escalated),
            _ => None,
        }
    }

    /// Outgoing edges. `Closed` is terminal; `Escalated` can only come
    /// back through `Resolved`.
    pub fn allowed_next(self) -> &'static [IncidentState] {
        match self {
            IncidentState::New => &[IncidentState::Triage, IncidentState::Escalated],
            IncidentState::Triage => {
                &[IncidentState::EvidenceAttached, IncidentState::Escalated]
            }
            IncidentState::EvidenceAttached => {
                &[IncidentState::Dispatched, IncidentState::Escalated]
            }
            IncidentState::Dispatched => {
                &[IncidentState::Resolved, IncidentState::Escalated]
            }
            IncidentState::Resolved => &[IncidentState::Closed, IncidentState::Escalated],
            IncidentState::Escalated => &[IncidentState::Resolved],
            IncidentState::Closed => &[],
        }
    }

    /// True when `(self, to)` is an edge of the graph.
    pub fn can_transition_to(self, to: IncidentState) -> bool {
        self.allowed_next().contains(&to)
    }
}

impl std::fmt::Display for IncidentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failures raised by the SOC domain.
#[derive(Debug, thiserror::Error)]
pub enum SocError {
    /// No incident under the given identifier.
    #[error("incident {0} not found")]
    NotFound(String),
    /// Requested target state is not a node of the graph.
    #[error("unknown incident state '{0}'")]
    UnknownState(String),
    /// The stored state is not a node of the graph - a corrupt row.
    #[error("incident carries unknown stored state '{0}'")]
    CorruptState(String),
    /// The requested edge does not exist.
    #[error("invalid transition from '{from}' to '{to}', allowed: {allowed:?}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
        /// Edges available from `from`.
        allowed: Vec<&'static str>,
    },
    /// The compare-and-swap lost against a concurrent writer.
    #[error("concurrent modification detected for incident {0}, retry")]
    ConcurrentModification(String),
    /// Underlying store failure.
    #[error("incident storage failure")]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn terminal_and_return_edges() {
        assert!(IncidentState::Closed.allowed_next().is_empty());
        assert_eq!(
            IncidentState::Escalated.allowed_next(),
            &[IncidentState::Resolved]
        );
        assert!(IncidentState::New.can_transition_to(IncidentState::Triage));
        assert!(!IncidentState::New.can_transition_to(IncidentState::Resolved));
    }

    #[test]
    fn parse_round_trips_every_state() {
        for state in IncidentState::ALL {
            assert_eq!(IncidentState::parse(state.as_str()), Some(state));
        }
        assert_eq!(IncidentState::parse("NonExistentState"), None);
        assert_eq!(IncidentState::parse("   "), None);
    }

    proptest! {
        /// Closure of the graph: every reachable target is itself a node,
        /// and the edge relation agrees with the adjacency lists.
        #[test]
        fn graph_is_closed_over_declared_states(
            from_idx in 0usize..IncidentState::ALL.len(),
            to_idx in 0usize..IncidentState::ALL.len(),
        ) {
            let from = IncidentState::ALL[from_idx];
            let to = IncidentState::ALL[to_idx];
            for target in from.allowed_next() {
                prop_assert!(IncidentState::ALL.contains(target));
            }
            prop_assert_eq!(
                from.can_transition_to(to),
                from.allowed_next().contains(&to)
            );
        }
    }
}
