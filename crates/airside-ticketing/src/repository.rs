//! Persistence adapters for tickets and assignments.
//!
//! Uniqueness per incident is enforced twice: a `UNIQUE (incident_id)`
//! index backs the `ON CONFLICT DO NOTHING` insert, and the service closes
//! the remaining SELECT→INSERT window by re-reading after a conflicted
//! insert. The in-memory adapter reproduces both behaviours under one
//! mutex for demo mode and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use airside_types::coerce_uuid;

use crate::TicketError;

//─────────────────────────────
//  Rows
//─────────────────────────────

/// A ticket row as stored. `status` stays a raw string so the service can
/// flag corrupt rows instead of losing them in deserialization.
#[derive(Debug, Clone, Serialize)]
pub struct Ticket {
    /// Row identifier.
    pub id: Uuid,
    /// Owning incident (derived uuid); unique across tickets.
    pub incident_id: Uuid,
    /// Lifecycle status as stored.
    pub status: String,
    /// Priority snapshot taken at creation.
    pub priority: String,
    /// Resolution deadline, UTC.
    pub sla_deadline: DateTime<Utc>,
    /// Row creation instant.
    pub created_at: DateTime<Utc>,
}

/// Input for creating a ticket.
#[derive(Debug, Clone)]
pub struct NewTicket {
    /// Row identifier.
    pub id: Uuid,
    /// Owning incident (derived uuid).
    pub incident_id: Uuid,
    /// Initial status.
    pub status: String,
    /// Priority snapshot.
    pub priority: String,
    /// Resolution deadline.
    pub sla_deadline: DateTime<Utc>,
}

/// One assignment record.
#[derive(Debug, Clone, Serialize)]
pub struct TicketAssignment {
    /// Assignment row identifier.
    pub id: Uuid,
    /// The assigned ticket.
    pub ticket_id: Uuid,
    /// Assignee (derived uuid).
    pub assignee_id: Uuid,
    /// When the assignment was recorded.
    pub assigned_at: DateTime<Utc>,
}

//─────────────────────────────
//  Contract
//─────────────────────────────

/// Persistence contract for the ticketing context.
#[async_trait]
pub trait TicketRepository: Send + Sync {
    /// Fetch by public ticket identifier.
    async fn get(&self, public_id: &str) -> Result<Option<Ticket>, TicketError>;

    /// Fetch the ticket owned by an incident, if any.
    async fn get_by_incident(&self, incident_id: Uuid)
        -> Result<Option<Ticket>, TicketError>;

    /// Insert unless the incident already owns a ticket. Returns `false`
    /// when the uniqueness guard swallowed the insert.
    async fn create_if_absent(&self, row: NewTicket) -> Result<bool, TicketError>;

    /// Atomic compare-and-swap on the status. `false` when no row matched.
    async fn transition_status(
        &self,
        id: Uuid,
        from_status: &str,
        to_status: &str,
    ) -> Result<bool, TicketError>;

    /// Record an assignment.
    async fn record_assignment(
        &self,
        ticket_id: Uuid,
        assignee_id: Uuid,
    ) -> Result<(), TicketError>;

    /// Assignments for one ticket, oldest first.
    async fn assignments(&self, ticket_id: Uuid)
        -> Result<Vec<TicketAssignment>, TicketError>;
}

//─────────────────────────────
//  PostgreSQL adapter
//─────────────────────────────

/// PostgreSQL-backed ticket repository.
#[derive(Clone)]
pub struct PgTicketRepository {
    pool: PgPool,
}

impl PgTicketRepository {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_ticket(row: &sqlx::postgres::PgRow) -> Result<Ticket, sqlx::Error> {
        Ok(Ticket {
            id: row.try_get("id")?,
            incident_id: row.try_get("incident_id")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            sla_deadline: row.try_get("sla_deadline")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl TicketRepository for PgTicketRepository {
    async fn get(&self, public_id: &str) -> Result<Option<Ticket>, TicketError> {
        let id = coerce_uuid(public_id);
        let row = sqlx::query(
            "SELECT id, incident_id, status, priority, sla_deadline, created_at \
             FROM tickets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch ticket")?;

        row.map(|r| Self::row_to_ticket(&r).context("decode ticket row"))
            .transpose()
            .map_err(TicketError::Storage)
    }

    async fn get_by_incident(
        &self,
        incident_id: Uuid,
    ) -> Result<Option<Ticket>, TicketError> {
        let row = sqlx::query(
            "SELECT id, incident_id, status, priority, sla_deadline, created_at \
             FROM tickets WHERE incident_id = $1",
        )
        .bind(incident_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch ticket by incident")?;

        row.map(|r| Self::row_to_ticket(&r).context("decode ticket row"))
            .transpose()
            .map_err(TicketError::Storage)
    }

    async fn create_if_absent(&self, row: NewTicket) -> Result<bool, TicketError> {
        let inserted = sqlx::query(
            "INSERT INTO tickets (id, incident_id, status, priority, sla_deadline, created_at) \
             VALUES ($1, $2, $3, $4, $5, NOW()) \
             ON CONFLICT (incident_id) DO NOTHING",
        )
        .bind(row.id)
        .bind(row.incident_id)
        .bind(&row.status)
        .bind(&row.priority)
        .bind(row.sla_deadline)
        .execute(&self.pool)
        .await
        .context("insert ticket")?;
        Ok(inserted.rows_affected() == 1)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from_status: &str,
        to_status: &str,
    ) -> Result<bool, TicketError> {
        let updated = sqlx::query(
            "UPDATE tickets SET status = $1 WHERE id = $2 AND status = $3",
        )
        .bind(to_status)
        .bind(id)
        .bind(from_status)
        .execute(&self.pool)
        .await
        .context("cas ticket status")?;
        Ok(updated.rows_affected() == 1)
    }

    async fn record_assignment(
        &self,
        ticket_id: Uuid,
        assignee_id: Uuid,
    ) -> Result<(), TicketError> {
        sqlx::query(
            "INSERT INTO ticket_assignments (id, ticket_id, assignee_id, assigned_at) \
             VALUES ($1, $2, $3, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(ticket_id)
        .bind(assignee_id)
        .execute(&self.pool)
        .await
        .context("insert assignment")?;
        Ok(())
    }

    async fn assignments(
        &self,
        ticket_id: Uuid,
    ) -> Result<Vec<TicketAssignment>, TicketError> {
        let rows = sqlx::query(
            "SELECT id, ticket_id, assignee_id, assigned_at \
             FROM ticket_assignments WHERE ticket_id = $1 ORDER BY assigned_at",
        )
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await
        .context("fetch assignments")?;

        rows.iter()
            .map(|row| {
                Ok(TicketAssignment {
                    id: row.try_get("id")?,
                    ticket_id: row.try_get("ticket_id")?,
                    assignee_id: row.try_get("assignee_id")?,
                    assigned_at: row.try_get("assigned_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("decode assignment rows")
            .map_err(TicketError::Storage)
    }
}

//─────────────────────────────
//  In-memory adapter
//─────────────────────────────

/// Process-local ticket repository for demo mode and tests.
#[derive(Default)]
pub struct MemoryTicketRepository {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    tickets: HashMap<Uuid, Ticket>,
    by_incident: HashMap<Uuid, Uuid>,
    assignments: Vec<TicketAssignment>,
}

impl MemoryTicketRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[async_trait]
impl TicketRepository for MemoryTicketRepository {
    async fn get(&self, public_id: &str) -> Result<Option<Ticket>, TicketError> {
        let id = coerce_uuid(public_id);
        Ok(self.lock().tickets.get(&id).cloned())
    }

    async fn get_by_incident(
        &self,
        incident_id: Uuid,
    ) -> Result<Option<Ticket>, TicketError> {
        let state = self.lock();
        Ok(state
            .by_incident
            .get(&incident_id)
            .and_then(|ticket_id| state.tickets.get(ticket_id))
            .cloned())
    }

    async fn create_if_absent(&self, row: NewTicket) -> Result<bool, TicketError> {
        let mut state = self.lock();
        if state.by_incident.contains_key(&row.incident_id) {
            return Ok(false);
        }
        state.by_incident.insert(row.incident_id, row.id);
        state.tickets.insert(
            row.id,
            Ticket {
                id: row.id,
                incident_id: row.incident_id,
                status: row.status,
                priority: row.priority,
                sla_deadline: row.sla_deadline,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from_status: &str,
        to_status: &str,
    ) -> Result<bool, TicketError> {
        let mut state = self.lock();
        let Some(ticket) = state.tickets.get_mut(&id) else {
            return Ok(false);
        };
        if ticket.status != from_status {
            return Ok(false);
        }
        ticket.status = to_status.to_owned();
        Ok(true)
    }

    async fn record_assignment(
        &self,
        ticket_id: Uuid,
        assignee_id: Uuid,
    ) -> Result<(), TicketError> {
        self.lock().assignments.push(TicketAssignment {
            id: Uuid::new_v4(),
            ticket_id,
            assignee_id,
            assigned_at: Utc::now(),
        });
        Ok(())
    }

    async fn assignments(
        &self,
        ticket_id: Uuid,
    ) -> Result<Vec<TicketAssignment>, TicketError> {
        Ok(self
            .lock()
            .assignments
            .iter()
            .filter(|a| a.ticket_id == ticket_id)
            .cloned()
            .collect())
    }
}
