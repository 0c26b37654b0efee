#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **airside-runtime** – Runtime assembly for the airside backend.
//!
//! This crate sits between the deterministic domain crates and the outside
//! world: it picks the event log driver at startup (durable by default,
//! in-memory when demo mode asks for it or the durable store is down and
//! fallback is allowed), owns the long-lived consumer tasks that fan events
//! into the write model, and manages the database pool and schema.
//!
//! Backend choice happens exactly once per process; everything downstream
//! only ever sees the [`EventBus`] facade.

mod consumers;
mod dispatch;

/// Database pool and schema lifecycle.
pub mod db;

pub use consumers::ConsumerManager;
pub use dispatch::{DispatchError, Dispatcher, FleetTelemetrySink, LoggingFleetSink};

use std::sync::Arc;

use tracing::{info, warn};

use airside_bus_core::{BackendKind, EventBus, EventLog, LogError, CONSUMER_GROUPS, STREAMS};
use airside_log_memory::MemoryLog;
use airside_log_redis::RedisLog;

//─────────────────────────────
//  Bus selection
//─────────────────────────────

/// Startup configuration for the event bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Durable log endpoint.
    pub redis_url: String,
    /// Force the in-memory driver (demo mode).
    pub in_memory: bool,
    /// When the durable store is unreachable at startup, bind the
    /// in-memory driver instead of failing boot.
    pub fallback_to_memory: bool,
}

/// Bind the event bus to exactly one driver.
///
/// The durable backend is probed by creating the required consumer groups
/// on both streams; only an [`LogError::Unavailable`] probe result is
/// eligible for the memory fallback - configuration and auth problems stay
/// fatal.
pub async fn init_bus(config: &BusConfig) -> anyhow::Result<EventBus> {
    if config.in_memory {
        warn!("demo mode: using in-memory event bus, nothing will persist");
        return memory_bus().await;
    }

    let log = RedisLog::open(&config.redis_url)?;
    match ensure_groups(&log).await {
        Ok(()) => {
            info!(redis_url = %config.redis_url, "event bus bound to durable log");
            Ok(EventBus::new(Arc::new(log), BackendKind::Durable))
        }
        Err(LogError::Unavailable(reason)) if config.fallback_to_memory => {
            warn!(%reason, "durable log unavailable, falling back to in-memory bus");
            memory_bus().await
        }
        Err(err) => Err(err.into()),
    }
}

async fn memory_bus() -> anyhow::Result<EventBus> {
    let log = MemoryLog::new();
    ensure_groups(&log).await?;
    Ok(EventBus::new(Arc::new(log), BackendKind::Memory))
}

/// Idempotently create every required consumer group on both streams.
pub async fn ensure_groups(log: &dyn EventLog) -> Result<(), LogError> {
    for stream in STREAMS {
        for group in CONSUMER_GROUPS {
            log.ensure_group(stream, group).await?;
        }
    }
    Ok(())
}
