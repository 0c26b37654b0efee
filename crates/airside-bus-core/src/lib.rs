#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **airside-bus-core** – Event log abstraction and bus facade.
//!
//! The log is modelled as a narrow capability - append, tail, range, latest,
//! consumer-group read/ack, group creation - implemented by two drivers: a
//! durable Redis Streams backend and a process-local in-memory backend used
//! in demo mode. Producers and endpoints only ever talk to the [`EventBus`]
//! facade, which binds exactly one driver at startup; the `mem:`/`log:`
//! cursor prefix on [`EventBus::list_events`] is the only place the choice
//! is allowed to show.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use airside_types::{EventEnvelope, Severity};

//─────────────────────────────
//  Streams and consumer groups
//─────────────────────────────

/// The stream every operator-facing event lands on.
pub const GLOBAL_STREAM: &str = "stream:events:global";
/// Scenario producers publish here; the SOC core consumes it.
pub const SIMULATION_STREAM: &str = "stream:events:simulation";
/// Both well-known streams.
pub const STREAMS: [&str; 2] = [GLOBAL_STREAM, SIMULATION_STREAM];

/// Consumer groups created (idempotently) on startup.
pub const CONSUMER_GROUPS: [&str; 5] = [
    "cg:soc-core",
    "cg:read-models",
    "cg:audit",
    "cg:analytics",
    "cg:frontend-fanout",
];

/// Group driving the write-model updaters on the global stream.
pub const GROUP_READ_MODELS: &str = "cg:read-models";
/// Group consuming simulation output for the SOC core.
pub const GROUP_SOC_CORE: &str = "cg:soc-core";

//─────────────────────────────
//  Entry ids and cursors
//─────────────────────────────

/// Identifier the log assigns to an appended entry. Totally ordered within
/// a stream, never across streams.
pub type EntryId = String;

/// A position within a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Only entries appended after subscription (`$`).
    Tail,
    /// From the beginning of the stream (`0` / `-`).
    Start,
    /// Strictly after a concrete entry id previously returned by the log.
    At(EntryId),
}

impl Cursor {
    /// Parse a wire cursor. Empty input means "tail", matching the push
    /// endpoint default.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "$" => Cursor::Tail,
            "0" | "-" | "0-0" => Cursor::Start,
            concrete => Cursor::At(concrete.to_owned()),
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cursor::Tail => f.write_str("$"),
            Cursor::Start => f.write_str("0"),
            Cursor::At(id) => f.write_str(id),
        }
    }
}

//─────────────────────────────
//  Error kinds
//─────────────────────────────

/// Failure kinds surfaced by log drivers.
///
/// `Tail` and `GroupRead` report an elapsed block window as an empty result,
/// never as an error; these variants are reserved for real faults.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Backend unreachable; consumers back off, HTTP surfaces 503.
    #[error("event log backend unavailable: {0}")]
    Unavailable(String),
    /// Unknown stream or consumer group.
    #[error("unknown stream or group: {0}")]
    NotFound(String),
    /// Retryable failure (timeout, dropped connection mid-command).
    #[error("transient event log failure: {0}")]
    Transient(String),
    /// Configuration or authentication problem; retrying will not help.
    #[error("fatal event log error: {0}")]
    Fatal(String),
}

//─────────────────────────────
//  Log capability
//─────────────────────────────

/// A durable, ordered, per-stream log with consumer-group semantics.
///
/// Implementations must preserve per-stream append order on every read
/// path and keep group offsets monotonic under acknowledgement. Blocking
/// operations must return within roughly the given window when no entry
/// arrives.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append atomically; returns the generated entry id.
    async fn append(&self, stream: &str, envelope: &EventEnvelope)
        -> Result<EntryId, LogError>;

    /// Wait up to `block` for the next entry strictly after `from`.
    /// Returns at most one entry, or `None` on timeout.
    async fn tail(
        &self,
        stream: &str,
        from: &Cursor,
        block: Duration,
    ) -> Result<Option<(EntryId, EventEnvelope)>, LogError>;

    /// Forward scan, exclusive of `after` unless it is [`Cursor::Start`].
    async fn range(
        &self,
        stream: &str,
        after: &Cursor,
        limit: usize,
    ) -> Result<Vec<(EntryId, EventEnvelope)>, LogError>;

    /// The newest `limit` entries, in chronological order.
    async fn latest(
        &self,
        stream: &str,
        limit: usize,
    ) -> Result<Vec<(EntryId, EventEnvelope)>, LogError>;

    /// Read up to `count` entries not yet acknowledged by `group`, waiting
    /// up to `block` when none are ready.
    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<(EntryId, EventEnvelope)>, LogError>;

    /// Advance the group offset past `entry`.
    async fn group_ack(&self, stream: &str, group: &str, entry: &str)
        -> Result<(), LogError>;

    /// Idempotent; creates stream and group with offset 0 if absent.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), LogError>;
}

//─────────────────────────────
//  Publish drafts
//─────────────────────────────

/// Everything a producer supplies when publishing; the bus fills in
/// `event_id`, `timestamp` and, when absent, `correlation_id`.
#[derive(Debug, Clone)]
pub struct EventDraft {
    /// Dotted event name.
    pub event_type: String,
    /// Producing bounded context.
    pub source_context: String,
    /// Defaults to `info`.
    pub severity: Severity,
    /// Taken over when non-empty; otherwise a fresh uuid is assigned.
    pub correlation_id: Option<String>,
    /// Role name → public identifier.
    pub entity_refs: BTreeMap<String, String>,
    /// Domain-specific body.
    pub payload: JsonMap<String, JsonValue>,
    /// Target stream; defaults to [`GLOBAL_STREAM`].
    pub stream: String,
}

impl EventDraft {
    /// Start a draft for `event_type` produced by `source_context`.
    pub fn new(event_type: impl Into<String>, source_context: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source_context: source_context.into(),
            severity: Severity::Info,
            correlation_id: None,
            entity_refs: BTreeMap::new(),
            payload: JsonMap::new(),
            stream: GLOBAL_STREAM.to_owned(),
        }
    }

    /// Set the severity.
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Carry an existing correlation id. Empty strings are ignored.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        if !correlation_id.trim().is_empty() {
            self.correlation_id = Some(correlation_id);
        }
        self
    }

    /// Add an entity reference (`role` → public identifier).
    pub fn entity_ref(mut self, role: impl Into<String>, id: impl Into<String>) -> Self {
        self.entity_refs.insert(role.into(), id.into());
        self
    }

    /// Replace the payload body.
    pub fn payload(mut self, payload: JsonMap<String, JsonValue>) -> Self {
        self.payload = payload;
        self
    }

    /// Target a specific stream instead of the global one.
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    fn into_envelope(self) -> (String, EventEnvelope) {
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4().to_string(),
            event_type: self.event_type,
            source_context: self.source_context,
            severity: self.severity,
            timestamp: Utc::now(),
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            entity_refs: self.entity_refs,
            payload: self.payload,
            extra: BTreeMap::new(),
        };
        (self.stream, envelope)
    }
}

//─────────────────────────────
//  Bus facade
//─────────────────────────────

/// Which driver the facade bound at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Process-local vector log (demo mode).
    Memory,
    /// External durable log.
    Durable,
}

impl BackendKind {
    /// Prefix tagging `list_events` cursors with their backend.
    pub fn cursor_prefix(self) -> &'static str {
        match self {
            BackendKind::Memory => "mem:",
            BackendKind::Durable => "log:",
        }
    }
}

/// One page of cursored history.
#[derive(Debug, Clone)]
pub struct EventPage {
    /// Envelopes in stream order.
    pub items: Vec<EventEnvelope>,
    /// Opaque cursor for the next forward page.
    pub next_cursor: String,
}

/// The single surface producers and endpoints consume.
///
/// Holds exactly one [`EventLog`] driver; the choice is made once at init
/// and is immutable for the process lifetime.
#[derive(Clone)]
pub struct EventBus {
    log: Arc<dyn EventLog>,
    backend: BackendKind,
}

impl EventBus {
    /// Bind the facade to a driver.
    pub fn new(log: Arc<dyn EventLog>, backend: BackendKind) -> Self {
        Self { log, backend }
    }

    /// Which driver is bound.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// True when running on the in-memory driver.
    pub fn is_in_memory(&self) -> bool {
        self.backend == BackendKind::Memory
    }

    /// Direct access to the bound log, for the consumer manager.
    pub fn log(&self) -> Arc<dyn EventLog> {
        Arc::clone(&self.log)
    }

    /// Stamp and append a draft; returns the assigned entry id.
    pub async fn publish(&self, draft: EventDraft) -> Result<EntryId, LogError> {
        let (stream, envelope) = draft.into_envelope();
        self.log.append(&stream, &envelope).await
    }

    /// Next entry on the global stream for the push endpoint, or `None`
    /// when the block window elapses.
    pub async fn tail_for_push(
        &self,
        cursor: &Cursor,
        block: Duration,
    ) -> Result<Option<(EntryId, EventEnvelope)>, LogError> {
        self.log.tail(GLOBAL_STREAM, cursor, block).await
    }

    /// Cursored history over the global stream.
    ///
    /// Without a cursor: the newest `limit` entries plus a cursor for
    /// forward paging. With one: the page strictly after it. A cursor
    /// minted by the other backend is ignored and treated as absent.
    pub async fn list_events(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<EventPage, LogError> {
        let prefix = self.backend.cursor_prefix();
        let inner = cursor
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .and_then(|c| c.strip_prefix(prefix));

        let (entries, fallback) = match inner {
            None => (self.log.latest(GLOBAL_STREAM, limit).await?, "0".to_owned()),
            Some(raw) => {
                let after = Cursor::parse(raw);
                (
                    self.log.range(GLOBAL_STREAM, &after, limit).await?,
                    raw.to_owned(),
                )
            }
        };

        let next = entries
            .last()
            .map(|(id, _)| id.clone())
            .unwrap_or(fallback);
        Ok(EventPage {
            items: entries.into_iter().map(|(_, envelope)| envelope).collect(),
            next_cursor: format!("{prefix}{next}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Captures appends so facade behaviour can be asserted without a
    /// real driver.
    #[derive(Default)]
    struct RecordingLog {
        appended: Mutex<Vec<(String, EventEnvelope)>>,
    }

    #[async_trait]
    impl EventLog for RecordingLog {
        async fn append(
            &self,
            stream: &str,
            envelope: &EventEnvelope,
        ) -> Result<EntryId, LogError> {
            let mut appended = self.appended.lock().unwrap();
            appended.push((stream.to_owned(), envelope.clone()));
            Ok(format!("0-{}", appended.len() - 1))
        }

        async fn tail(
            &self,
            _stream: &str,
            _from: &Cursor,
            _block: Duration,
        ) -> Result<Option<(EntryId, EventEnvelope)>, LogError> {
            Ok(None)
        }

        async fn range(
            &self,
            _stream: &str,
            after: &Cursor,
            _limit: usize,
        ) -> Result<Vec<(EntryId, EventEnvelope)>, LogError> {
            assert_eq!(*after, Cursor::At("5-5".to_owned()));
            Ok(vec![])
        }

        async fn latest(
            &self,
            _stream: &str,
            limit: usize,
        ) -> Result<Vec<(EntryId, EventEnvelope)>, LogError> {
            let appended = self.appended.lock().unwrap();
            let skip = appended.len().saturating_sub(limit);
            Ok(appended
                .iter()
                .skip(skip)
                .enumerate()
                .map(|(i, (_, envelope))| (format!("0-{}", skip + i), envelope.clone()))
                .collect())
        }

        async fn group_read(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _count: usize,
            _block: Duration,
        ) -> Result<Vec<(EntryId, EventEnvelope)>, LogError> {
            Ok(vec![])
        }

        async fn group_ack(
            &self,
            _stream: &str,
            _group: &str,
            _entry: &str,
        ) -> Result<(), LogError> {
            Ok(())
        }

        async fn ensure_group(&self, _stream: &str, _group: &str) -> Result<(), LogError> {
            Ok(())
        }
    }

    #[test]
    fn cursor_wire_forms() {
        assert_eq!(Cursor::parse("$"), Cursor::Tail);
        assert_eq!(Cursor::parse(""), Cursor::Tail);
        assert_eq!(Cursor::parse("0"), Cursor::Start);
        assert_eq!(Cursor::parse("-"), Cursor::Start);
        assert_eq!(Cursor::parse("0-0"), Cursor::Start);
        assert_eq!(
            Cursor::parse("1722520000000-3"),
            Cursor::At("1722520000000-3".to_owned())
        );
        assert_eq!(Cursor::At("9-1".to_owned()).to_string(), "9-1");
    }

    #[tokio::test]
    async fn publish_stamps_identity_fields() {
        let log = Arc::new(RecordingLog::default());
        let bus = EventBus::new(log.clone(), BackendKind::Memory);

        bus.publish(
            EventDraft::new("incident.created", "simulation")
                .severity(Severity::Critical)
                .entity_ref("incidentId", "I1"),
        )
        .await
        .unwrap();

        let appended = log.appended.lock().unwrap();
        let (stream, envelope) = &appended[0];
        assert_eq!(stream, GLOBAL_STREAM);
        assert_eq!(envelope.event_type, "incident.created");
        assert_eq!(envelope.severity, Severity::Critical);
        assert!(!envelope.event_id.is_empty());
        assert!(!envelope.correlation_id.is_empty());
        assert_eq!(
            envelope.entity_refs.get("incidentId").map(String::as_str),
            Some("I1")
        );
    }

    #[tokio::test]
    async fn publish_keeps_caller_correlation_id() {
        let log = Arc::new(RecordingLog::default());
        let bus = EventBus::new(log.clone(), BackendKind::Memory);

        bus.publish(EventDraft::new("ticket.created", "ticketing").correlation_id("C1"))
            .await
            .unwrap();
        bus.publish(EventDraft::new("ticket.created", "ticketing").correlation_id("  "))
            .await
            .unwrap();

        let appended = log.appended.lock().unwrap();
        assert_eq!(appended[0].1.correlation_id, "C1");
        assert_ne!(appended[1].1.correlation_id, "  ");
        assert!(!appended[1].1.correlation_id.is_empty());
    }

    #[tokio::test]
    async fn list_events_tags_and_strips_cursors() {
        let log = Arc::new(RecordingLog::default());
        let bus = EventBus::new(log.clone(), BackendKind::Memory);

        bus.publish(EventDraft::new("a.b", "test")).await.unwrap();
        bus.publish(EventDraft::new("c.d", "test")).await.unwrap();

        // No cursor: newest N, cursor tagged with the backend prefix.
        let page = bus.list_events(None, 50).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor, "mem:0-1");

        // A concrete cursor is stripped and resolved by the driver; the
        // RecordingLog asserts the parsed position.
        let page = bus.list_events(Some("mem:5-5"), 50).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_cursor, "mem:5-5");

        // Foreign-prefix cursors are ignored entirely.
        let page = bus.list_events(Some("log:5-5"), 50).await.unwrap();
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn empty_history_yields_start_cursor() {
        let bus = EventBus::new(Arc::new(RecordingLog::default()), BackendKind::Memory);
        let page = bus.list_events(None, 10).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_cursor, "mem:0");
    }
}
