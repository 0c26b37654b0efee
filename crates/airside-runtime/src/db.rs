//! Database pool and schema lifecycle.
//!
//! One process-wide pool, created at startup and closed on shutdown. The
//! schema setup is idempotent (`CREATE ... IF NOT EXISTS`), so running it
//! on every boot with `AUTO_MIGRATE` enabled is safe.
//!
//! The `UNIQUE` constraint on `tickets.incident_id` backs the idempotent
//! escalation path: without it the SELECT→INSERT window would let two
//! racing escalations each create a ticket.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Upper bound on pooled connections.
const MAX_CONNECTIONS: u32 = 10;

/// Connect the process-wide pool.
pub async fn connect_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect(database_url)
        .await
        .context("connect database pool")?;
    Ok(pool)
}

/// Create the core tables and indexes if absent.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS incidents (
            id UUID PRIMARY KEY,
            type TEXT NOT NULL,
            severity TEXT NOT NULL,
            state TEXT NOT NULL,
            correlation_id UUID NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            location JSONB
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create incidents table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS incident_transitions (
            id UUID PRIMARY KEY,
            incident_id UUID NOT NULL REFERENCES incidents(id),
            from_state TEXT NOT NULL,
            to_state TEXT NOT NULL,
            triggered_by TEXT NOT NULL,
            occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create incident_transitions table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tickets (
            id UUID PRIMARY KEY,
            incident_id UUID NOT NULL UNIQUE,
            status TEXT NOT NULL,
            priority TEXT NOT NULL,
            sla_deadline TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create tickets table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ticket_assignments (
            id UUID PRIMARY KEY,
            ticket_id UUID NOT NULL REFERENCES tickets(id),
            assignee_id UUID NOT NULL,
            assigned_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("create ticket_assignments table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transitions_incident \
         ON incident_transitions(incident_id)",
    )
    .execute(pool)
    .await
    .context("create transitions index")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_assignments_ticket \
         ON ticket_assignments(ticket_id)",
    )
    .execute(pool)
    .await
    .context("create assignments index")?;

    info!("database schema is current");
    Ok(())
}
