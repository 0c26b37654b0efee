//! Persistence adapters for incidents and their transition audit trail.
//!
//! Two implementations share one contract: the PostgreSQL adapter used in
//! production and an in-memory adapter carrying demo mode and tests. Both
//! perform the state transition as an atomic compare-and-swap so a stale
//! writer can never clobber a newer state, and both record the audit entry
//! only when the swap succeeded.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use airside_types::coerce_uuid;

use crate::SocError;

//─────────────────────────────
//  Rows
//─────────────────────────────

/// An incident row as stored.
///
/// `state` and `severity` stay raw strings on purpose: the service layer
/// decides what a value outside the expected sets means (corrupt row vs
/// lenient severity), so the repository must not lose it on the way out.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    /// Row identifier (derived uuid).
    pub id: Uuid,
    /// Incident category, e.g. `FLEET_OVERSPEED`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Severity as stored.
    pub severity: String,
    /// State as stored.
    pub state: String,
    /// Immutable after creation.
    pub correlation_id: Uuid,
    /// Row creation instant.
    pub created_at: DateTime<Utc>,
    /// Optional geo/zone blob.
    pub location: Option<JsonValue>,
}

/// Input for inserting an incident row.
#[derive(Debug, Clone)]
pub struct NewIncident {
    /// Row identifier (derived uuid).
    pub id: Uuid,
    /// Incident category.
    pub kind: String,
    /// Severity string as produced.
    pub severity: String,
    /// Initial state string.
    pub state: String,
    /// Correlation uuid.
    pub correlation_id: Uuid,
    /// Optional geo/zone blob.
    pub location: Option<JsonValue>,
}

/// One audit entry of the incident transition trail.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentTransition {
    /// Audit row identifier.
    pub id: Uuid,
    /// The incident that moved.
    pub incident_id: Uuid,
    /// State before.
    pub from_state: String,
    /// State after.
    pub to_state: String,
    /// Operator or system actor.
    pub triggered_by: String,
    /// When the transition committed.
    pub occurred_at: DateTime<Utc>,
}

//─────────────────────────────
//  Contract
//─────────────────────────────

/// Persistence contract for the SOC context.
#[async_trait]
pub trait IncidentRepository: Send + Sync {
    /// Fetch by public identifier (coerced to the row uuid).
    async fn get(&self, public_id: &str) -> Result<Option<Incident>, SocError>;

    /// Insert unless a row with the same id already exists.
    async fn insert_if_absent(&self, row: NewIncident) -> Result<(), SocError>;

    /// Unconditional state write, used by the read-model updater.
    async fn force_state(&self, id: Uuid, to_state: &str) -> Result<(), SocError>;

    /// Atomic compare-and-swap plus audit insert in one transaction.
    ///
    /// Returns `false` when the swap touched no row - the state moved
    /// underneath the caller - in which case no audit entry is written.
    async fn transition_with_audit(
        &self,
        id: Uuid,
        from_state: &str,
        to_state: &str,
        triggered_by: &str,
    ) -> Result<bool, SocError>;

    /// Audit trail for one incident, oldest first.
    async fn transitions(&self, incident_id: Uuid)
        -> Result<Vec<IncidentTransition>, SocError>;
}

//─────────────────────────────
//  PostgreSQL adapter
//─────────────────────────────

/// PostgreSQL-backed incident repository.
#[derive(Clone)]
pub struct PgIncidentRepository {
    pool: PgPool,
}

impl PgIncidentRepository {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_incident(row: &sqlx::postgres::PgRow) -> Result<Incident, sqlx::Error> {
        Ok(Incident {
            id: row.try_get("id")?,
            kind: row.try_get("type")?,
            severity: row.try_get("severity")?,
            state: row.try_get("state")?,
            correlation_id: row.try_get("correlation_id")?,
            created_at: row.try_get("created_at")?,
            location: row.try_get("location")?,
        })
    }
}

#[async_trait]
impl IncidentRepository for PgIncidentRepository {
    async fn get(&self, public_id: &str) -> Result<Option<Incident>, SocError> {
        let id = coerce_uuid(public_id);
        let row = sqlx::query(
            "SELECT id, type, severity, state, correlation_id, created_at, location \
             FROM incidents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch incident")?;

        row.map(|r| Self::row_to_incident(&r).context("decode incident row"))
            .transpose()
            .map_err(SocError::Storage)
    }

    async fn insert_if_absent(&self, row: NewIncident) -> Result<(), SocError> {
        sqlx::query(
            "INSERT INTO incidents (id, type, severity, state, correlation_id, created_at, location) \
             VALUES ($1, $2, $3, $4, $5, NOW(), $6) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(row.id)
        .bind(&row.kind)
        .bind(&row.severity)
        .bind(&row.state)
        .bind(row.correlation_id)
        .bind(row.location)
        .execute(&self.pool)
        .await
        .context("insert incident")?;
        Ok(())
    }

    async fn force_state(&self, id: Uuid, to_state: &str) -> Result<(), SocError> {
        sqlx::query("UPDATE incidents SET state = $1 WHERE id = $2")
            .bind(to_state)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("force incident state")?;
        Ok(())
    }

    async fn transition_with_audit(
        &self,
        id: Uuid,
        from_state: &str,
        to_state: &str,
        triggered_by: &str,
    ) -> Result<bool, SocError> {
        let mut tx = self.pool.begin().await.context("begin transaction")?;

        let updated = sqlx::query(
            "UPDATE incidents SET state = $1 WHERE id = $2 AND state = $3",
        )
        .bind(to_state)
        .bind(id)
        .bind(from_state)
        .execute(&mut *tx)
        .await
        .context("cas update")?;

        if updated.rows_affected() != 1 {
            // Dropping the transaction rolls it back; nothing was written.
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO incident_transitions \
             (id, incident_id, from_state, to_state, triggered_by, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(from_state)
        .bind(to_state)
        .bind(triggered_by)
        .execute(&mut *tx)
        .await
        .context("insert audit row")?;

        tx.commit().await.context("commit transition")?;
        Ok(true)
    }

    async fn transitions(
        &self,
        incident_id: Uuid,
    ) -> Result<Vec<IncidentTransition>, SocError> {
        let rows = sqlx::query(
            "SELECT id, incident_id, from_state, to_state, triggered_by, occurred_at \
             FROM incident_transitions WHERE incident_id = $1 ORDER BY occurred_at",
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await
        .context("fetch transitions")?;

        rows.iter()
            .map(|row| {
                Ok(IncidentTransition {
                    id: row.try_get("id")?,
                    incident_id: row.try_get("incident_id")?,
                    from_state: row.try_get("from_state")?,
                    to_state: row.try_get("to_state")?,
                    triggered_by: row.try_get("triggered_by")?,
                    occurred_at: row.try_get("occurred_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("decode transition rows")
            .map_err(SocError::Storage)
    }
}

//─────────────────────────────
//  In-memory adapter
//─────────────────────────────

/// Process-local incident repository.
///
/// Carries demo mode (no database at all) and the test suite. The CAS runs
/// under a single mutex, giving the same exclusivity the database UPDATE
/// guard provides.
#[derive(Default)]
pub struct MemoryIncidentRepository {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    incidents: HashMap<Uuid, Incident>,
    audit: Vec<IncidentTransition>,
}

impl MemoryIncidentRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock means a panicking test; propagate the data anyway.
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[async_trait]
impl IncidentRepository for MemoryIncidentRepository {
    async fn get(&self, public_id: &str) -> Result<Option<Incident>, SocError> {
        let id = coerce_uuid(public_id);
        Ok(self.lock().incidents.get(&id).cloned())
    }

    async fn insert_if_absent(&self, row: NewIncident) -> Result<(), SocError> {
        let mut state = self.lock();
        state.incidents.entry(row.id).or_insert_with(|| Incident {
            id: row.id,
            kind: row.kind,
            severity: row.severity,
            state: row.state,
            correlation_id: row.correlation_id,
            created_at: Utc::now(),
            location: row.location,
        });
        Ok(())
    }

    async fn force_state(&self, id: Uuid, to_state: &str) -> Result<(), SocError> {
        let mut state = self.lock();
        if let Some(incident) = state.incidents.get_mut(&id) {
            incident.state = to_state.to_owned();
        }
        Ok(())
    }

    async fn transition_with_audit(
        &self,
        id: Uuid,
        from_state: &str,
        to_state: &str,
        triggered_by: &str,
    ) -> Result<bool, SocError> {
        let mut state = self.lock();
        let Some(incident) = state.incidents.get_mut(&id) else {
            return Ok(false);
        };
        if incident.state != from_state {
            return Ok(false);
        }
        incident.state = to_state.to_owned();
        state.audit.push(IncidentTransition {
            id: Uuid::new_v4(),
            incident_id: id,
            from_state: from_state.to_owned(),
            to_state: to_state.to_owned(),
            triggered_by: triggered_by.to_owned(),
            occurred_at: Utc::now(),
        });
        Ok(true)
    }

    async fn transitions(
        &self,
        incident_id: Uuid,
    ) -> Result<Vec<IncidentTransition>, SocError> {
        Ok(self
            .lock()
            .audit
            .iter()
            .filter(|t| t.incident_id == incident_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(state: &str) -> (MemoryIncidentRepository, Uuid) {
        let repo = MemoryIncidentRepository::new();
        let id = coerce_uuid("I1");
        repo.insert_if_absent(NewIncident {
            id,
            kind: "UNAUTHORIZED_ACCESS".to_owned(),
            severity: "critical".to_owned(),
            state: state.to_owned(),
            correlation_id: coerce_uuid("C1"),
            location: None,
        })
        .await
        .unwrap();
        (repo, id)
    }

    #[tokio::test]
    async fn cas_succeeds_only_once_per_observed_state() {
        let (repo, id) = seeded("New").await;

        let first = repo
            .transition_with_audit(id, "New", "Triage", "u1")
            .await
            .unwrap();
        let second = repo
            .transition_with_audit(id, "New", "Escalated", "u2")
            .await
            .unwrap();

        assert!(first);
        assert!(!second, "stale writer must lose the swap");
        assert_eq!(repo.transitions(id).await.unwrap().len(), 1);
        assert_eq!(repo.get("I1").await.unwrap().unwrap().state, "Triage");
    }

    #[tokio::test]
    async fn failed_cas_writes_no_audit_row() {
        let (repo, id) = seeded("Triage").await;
        let swapped = repo
            .transition_with_audit(id, "New", "Triage", "u1")
            .await
            .unwrap();
        assert!(!swapped);
        assert!(repo.transitions(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_if_absent_keeps_the_first_row() {
        let (repo, id) = seeded("New").await;
        repo.insert_if_absent(NewIncident {
            id,
            kind: "OTHER".to_owned(),
            severity: "info".to_owned(),
            state: "Closed".to_owned(),
            correlation_id: Uuid::new_v4(),
            location: None,
        })
        .await
        .unwrap();

        let row = repo.get("I1").await.unwrap().unwrap();
        assert_eq!(row.kind, "UNAUTHORIZED_ACCESS");
        assert_eq!(row.state, "New");
    }
}
