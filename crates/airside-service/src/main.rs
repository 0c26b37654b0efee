//! Service binary: configuration, wiring, serving, graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use clap::Parser;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use airside_runtime::{
    db, init_bus, BusConfig, ConsumerManager, Dispatcher, LoggingFleetSink,
};
use airside_service::settings::Settings;
use airside_service::state::AppState;
use airside_soc::{
    IncidentRepository, MemoryIncidentRepository, PgIncidentRepository, SocService,
};
use airside_ticketing::{
    MemoryTicketRepository, PgTicketRepository, TicketRepository, TicketService,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let settings = Settings::parse();

    init_logging()?;
    settings.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        demo_mode = settings.demo_mode,
        "starting airside service"
    );

    // 1. Event bus: one driver, chosen here, immutable afterwards.
    let bus = init_bus(&BusConfig {
        redis_url: settings.redis_url.clone(),
        in_memory: settings.wants_memory_bus(),
        fallback_to_memory: settings.bus_fallback_to_memory,
    })
    .await?;

    // 2. Repositories: PostgreSQL unless demo mode bypasses the database.
    let mut pool = None;
    let (incident_repo, ticket_repo): (Arc<dyn IncidentRepository>, Arc<dyn TicketRepository>) =
        if settings.demo_mode {
            warn!("demo mode: database bypassed, using in-memory repositories");
            (
                Arc::new(MemoryIncidentRepository::new()),
                Arc::new(MemoryTicketRepository::new()),
            )
        } else {
            let db_pool = db::connect_pool(&settings.database_url)
                .await
                .context("database pool")?;
            if settings.auto_migrate {
                db::migrate(&db_pool).await.context("auto-migrate")?;
            }
            let repos: (Arc<dyn IncidentRepository>, Arc<dyn TicketRepository>) = (
                Arc::new(PgIncidentRepository::new(db_pool.clone())),
                Arc::new(PgTicketRepository::new(db_pool.clone())),
            );
            pool = Some(db_pool);
            repos
        };

    // 3. Domain services and consumers share the same repositories, so the
    //    write model and the API agree even without a database.
    let soc = SocService::new(incident_repo.clone(), bus.clone());
    let tickets = TicketService::new(ticket_repo, bus.clone());
    let dispatcher = Arc::new(Dispatcher::new(incident_repo, Arc::new(LoggingFleetSink)));
    let consumers = Arc::new(ConsumerManager::new(bus.clone(), dispatcher));
    consumers.start().await;

    // 4. HTTP.
    let state = AppState {
        bus,
        soc,
        tickets,
        block: Duration::from_millis(settings.block_ms),
    };
    let app = airside_service::router(state)
        .layer(cors_layer(&settings))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("bind {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    info!("shutting down");
    consumers.stop().await;
    if let Some(pool) = pool {
        pool.close().await;
    }
    Ok(())
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow::anyhow!("tracing init: {err}"))?;
    Ok(())
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .origins()
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(%err, "failed to listen for shutdown signal");
    }
}
