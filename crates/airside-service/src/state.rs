//! Shared application state handed to every handler.

use std::time::Duration;

use airside_bus_core::EventBus;
use airside_soc::SocService;
use airside_ticketing::TicketService;

/// Everything the routes need, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// The bound event bus.
    pub bus: EventBus,
    /// Incident domain service.
    pub soc: SocService,
    /// Ticketing domain service.
    pub tickets: TicketService,
    /// Block window for push tails; also the keep-alive cadence.
    pub block: Duration,
}
