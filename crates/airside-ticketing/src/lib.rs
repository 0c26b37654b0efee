#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **airside-ticketing** – Ticket store and lifecycle.
//!
//! Tickets are born from incident escalations, carry an SLA deadline
//! derived from the incident severity at creation time, and walk a strict
//! `Open → InProgress → Resolved → Closed` lifecycle with the same
//! compare-and-swap discipline the incident machine uses. Creation is
//! idempotent on incident identity: however many times an incident
//! escalates, it owns at most one ticket.

mod repository;
mod service;

pub use repository::{
    MemoryTicketRepository, NewTicket, PgTicketRepository, Ticket, TicketAssignment,
    TicketRepository,
};
pub use service::{
    CreationOutcome, IncidentSnapshot, TicketAssignmentOutcome, TicketCreation,
    TicketService, TicketTransitionOutcome,
};

use airside_types::Severity;

//─────────────────────────────
//  Lifecycle states
//─────────────────────────────

/// A node in the ticket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TicketState {
    /// Created, unclaimed.
    Open,
    /// Being worked.
    InProgress,
    /// Work finished, pending closure.
    Resolved,
    /// Terminal.
    Closed,
}

impl TicketState {
    /// Stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TicketState::Open => "Open",
            TicketState::InProgress => "InProgress",
            TicketState::Resolved => "Resolved",
            TicketState::Closed => "Closed",
        }
    }

    /// Parse a stored or requested state; `None` outside the lifecycle.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "Open" => Some(TicketState::Open),
            "InProgress" => Some(TicketState::InProgress),
            "Resolved" => Some(TicketState::Resolved),
            "Closed" => Some(TicketState::Closed),
            _ => None,
        }
    }

    /// Outgoing edges; the lifecycle is a straight line ending at `Closed`.
    pub fn allowed_next(self) -> &'static [TicketState] {
        match self {
            TicketState::Open => &[TicketState::InProgress],
            TicketState::InProgress => &[TicketState::Resolved],
            TicketState::Resolved => &[TicketState::Closed],
            TicketState::Closed => &[],
        }
    }

    /// True when `(self, to)` is a lifecycle edge.
    pub fn can_transition_to(self, to: TicketState) -> bool {
        self.allowed_next().contains(&to)
    }
}

impl std::fmt::Display for TicketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  SLA policy
//─────────────────────────────

/// Resolution window in hours for a given severity, applied at creation.
pub fn sla_hours(severity: Severity) -> i64 {
    match severity {
        Severity::Critical => 4,
        Severity::Warning => 24,
        Severity::Info => 72,
    }
}

/// Ticket priority derived from the severity snapshot at creation.
pub fn priority_for(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "critical",
        Severity::Warning => "high",
        Severity::Info => "low",
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failures raised by the ticketing domain.
#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    /// No ticket under the given identifier.
    #[error("ticket {0} not found")]
    NotFound(String),
    /// Requested target state is outside the lifecycle.
    #[error("unknown ticket state '{0}'")]
    UnknownState(String),
    /// The stored status is outside the lifecycle - a corrupt row.
    #[error("ticket carries unknown stored state '{0}'")]
    CorruptState(String),
    /// The requested edge does not exist.
    #[error("invalid transition from '{from}' to '{to}', allowed: {allowed:?}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
        /// Edges available from `from`.
        allowed: Vec<&'static str>,
    },
    /// The compare-and-swap lost against a concurrent writer.
    #[error("concurrent modification detected for ticket {0}, retry")]
    ConcurrentModification(String),
    /// Caller input rejected before any store access.
    #[error("{0}")]
    InvalidArgument(String),
    /// Underlying store failure.
    #[error("ticket storage failure")]
    Storage(#[from] anyhow::Error),
}
