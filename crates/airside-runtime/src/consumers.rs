//! Long-lived consumer tasks with at-least-once delivery.
//!
//! One manager owns every consumer task in the process. On the durable
//! backend each declared (group, stream) pair gets its own task reading in
//! batches and acknowledging per entry after its side effect lands; a
//! failed handler leaves the entry pending, so the backend redelivers it.
//! On the in-memory backend a single task tails the collapsed stream from
//! the beginning - there is no redelivery, so invalid messages are logged
//! and lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use airside_bus_core::{
    Cursor, EventBus, EventLog, GLOBAL_STREAM, GROUP_READ_MODELS, GROUP_SOC_CORE,
    SIMULATION_STREAM,
};

use crate::dispatch::{DispatchError, Dispatcher};

/// Read window for blocking consumer reads.
const BLOCK: Duration = Duration::from_millis(2000);
/// Batch size per group read.
const BATCH: usize = 5;
/// Consumer name within each group; one worker per process.
const CONSUMER_NAME: &str = "worker-1";
/// Back-off after a transport failure in a consumer loop.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// The (group, stream) pairs served on the durable backend.
const GROUP_PAIRS: [(&str, &str); 2] = [
    (GROUP_READ_MODELS, GLOBAL_STREAM),
    (GROUP_SOC_CORE, SIMULATION_STREAM),
];

/// Owns and supervises the consumer tasks.
pub struct ConsumerManager {
    bus: EventBus,
    dispatcher: Arc<Dispatcher>,
    inner: tokio::sync::Mutex<ManagerInner>,
}

#[derive(Default)]
struct ManagerInner {
    running: bool,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ConsumerManager {
    /// Assemble over the bound bus and the dispatcher.
    pub fn new(bus: EventBus, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            bus,
            dispatcher,
            inner: tokio::sync::Mutex::new(ManagerInner::default()),
        }
    }

    /// Spawn the consumer tasks. Calling a running manager is a no-op.
    pub async fn start(&self) {
        let mut inner = self.inner.lock().await;
        if inner.running {
            return;
        }
        info!("starting consumers");
        inner.running = true;
        inner.cancel = CancellationToken::new();
        inner.tasks.clear();

        if self.bus.is_in_memory() {
            warn!("in-memory bus: starting single demo consumer");
            let bus = self.bus.clone();
            let dispatcher = Arc::clone(&self.dispatcher);
            let cancel = inner.cancel.clone();
            inner
                .tasks
                .push(tokio::spawn(demo_loop(bus, dispatcher, cancel)));
        } else {
            for (group, stream) in GROUP_PAIRS {
                let log = self.bus.log();
                let dispatcher = Arc::clone(&self.dispatcher);
                let cancel = inner.cancel.clone();
                inner
                    .tasks
                    .push(tokio::spawn(group_loop(log, stream, group, dispatcher, cancel)));
            }
        }
    }

    /// Cancel every task and wait for it to exit. Idempotent; safe to call
    /// on a manager that never started.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.tasks.is_empty() && !inner.running {
            return;
        }
        info!("stopping consumers");
        inner.running = false;
        inner.cancel.cancel();
        for task in inner.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(%err, "consumer task ended abnormally");
            }
        }
    }
}

/// In-memory mode: tail everything from the beginning, no explicit acks.
async fn demo_loop(bus: EventBus, dispatcher: Arc<Dispatcher>, cancel: CancellationToken) {
    let mut cursor = Cursor::Start;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = bus.tail_for_push(&cursor, BLOCK) => match result {
                Ok(Some((entry_id, envelope))) => {
                    if let Err(err) = dispatcher.dispatch(&envelope).await {
                        // No redelivery on this backend; log and move on.
                        error!(%entry_id, %err, "demo consumer dropped entry");
                    }
                    cursor = Cursor::At(entry_id);
                }
                Ok(None) => {}
                Err(err) => {
                    error!(%err, "demo consumer loop error");
                    pause(&cancel).await;
                }
            }
        }
    }
}

/// Durable mode: consumer-group read, dispatch, ack on success.
async fn group_loop(
    log: Arc<dyn EventLog>,
    stream: &'static str,
    group: &'static str,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) {
    loop {
        let read = log.group_read(stream, group, CONSUMER_NAME, BATCH, BLOCK);
        let entries = tokio::select! {
            _ = cancel.cancelled() => break,
            result = read => match result {
                Ok(entries) => entries,
                Err(err) => {
                    error!(stream, group, %err, "consumer read failed");
                    pause(&cancel).await;
                    continue;
                }
            }
        };

        for (entry_id, envelope) in entries {
            match dispatcher.dispatch(&envelope).await {
                Ok(()) => {
                    if let Err(err) = log.group_ack(stream, group, &entry_id).await {
                        warn!(stream, group, %entry_id, %err, "ack failed, entry will redeliver");
                    }
                }
                Err(DispatchError::InvalidMessage(reason)) => {
                    // Hard error: stays pending for redelivery.
                    error!(stream, group, %entry_id, %reason, "invalid message, not acking");
                }
                Err(err) => {
                    error!(stream, group, %entry_id, %err, "handler failed, not acking");
                }
            }
        }
    }
}

/// Cancellable back-off.
async fn pause(cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(RETRY_DELAY) => {}
    }
}
