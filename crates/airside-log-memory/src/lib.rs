#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **airside-log-memory** – In-memory event log driver.
//!
//! Demo-mode replacement for the durable log: a single append-only vector
//! behind a mutex, with waiters parked on a [`Notify`] that append
//! broadcasts to. Nothing persists across process restarts, and the two
//! well-known streams collapse into the one vector - exactly the visibility
//! an operator console needs when no external log store is running.
//!
//! Entry ids are `"<millisUnix>-<sequence>"` where the sequence is the
//! entry's index in the vector. Resolution is by identity match plus index,
//! never by lexicographic comparison. A concrete cursor the log does not
//! know replays from the beginning, which keeps operator reconnects safe
//! after a restart cleared memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};

use airside_bus_core::{Cursor, EntryId, EventLog, LogError};
use airside_types::EventEnvelope;

/// In-memory, non-persistent event log.
///
/// Cloning shares the underlying state; a fresh instance discards all prior
/// entries and group offsets, which is what bus re-initialisation relies on
/// for test isolation.
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    entries: Vec<(EntryId, EventEnvelope)>,
    /// (stream, group) → index of the first unacknowledged entry.
    offsets: HashMap<(String, String), usize>,
}

impl MemoryLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held. Test and diagnostics helper.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    /// True when no entry has been appended yet.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Index of the first entry strictly after `cursor`.
    ///
    /// `Tail` points past the end, `Start` at the beginning, and an unknown
    /// concrete id falls back to the beginning (replay-safe).
    fn resolve(state: &State, cursor: &Cursor) -> usize {
        match cursor {
            Cursor::Tail => state.entries.len(),
            Cursor::Start => 0,
            Cursor::At(id) => state
                .entries
                .iter()
                .position(|(entry_id, _)| entry_id == id)
                .map(|index| index + 1)
                .unwrap_or(0),
        }
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(
        &self,
        _stream: &str,
        envelope: &EventEnvelope,
    ) -> Result<EntryId, LogError> {
        let mut state = self.inner.state.lock().await;
        let sequence = state.entries.len();
        let entry_id = format!("{}-{}", Utc::now().timestamp_millis(), sequence);
        state.entries.push((entry_id.clone(), envelope.clone()));
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(entry_id)
    }

    async fn tail(
        &self,
        _stream: &str,
        from: &Cursor,
        block: Duration,
    ) -> Result<Option<(EntryId, EventEnvelope)>, LogError> {
        let state = self.inner.state.lock().await;
        let start = Self::resolve(&state, from);
        if let Some(entry) = state.entries.get(start) {
            return Ok(Some(entry.clone()));
        }
        if block.is_zero() {
            return Ok(None);
        }

        // Register interest before releasing the lock so an append in the
        // gap between unlock and await still wakes us.
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(state);

        match tokio::time::timeout(block, notified).await {
            Ok(()) => {
                let state = self.inner.state.lock().await;
                Ok(state.entries.get(start).cloned())
            }
            Err(_) => Ok(None),
        }
    }

    async fn range(
        &self,
        _stream: &str,
        after: &Cursor,
        limit: usize,
    ) -> Result<Vec<(EntryId, EventEnvelope)>, LogError> {
        let state = self.inner.state.lock().await;
        let start = Self::resolve(&state, after);
        Ok(state
            .entries
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest(
        &self,
        _stream: &str,
        limit: usize,
    ) -> Result<Vec<(EntryId, EventEnvelope)>, LogError> {
        let state = self.inner.state.lock().await;
        let skip = state.entries.len().saturating_sub(limit);
        Ok(state.entries.iter().skip(skip).cloned().collect())
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<(EntryId, EventEnvelope)>, LogError> {
        let key = (stream.to_owned(), group.to_owned());
        let state = self.inner.state.lock().await;
        let offset = *state
            .offsets
            .get(&key)
            .ok_or_else(|| LogError::NotFound(format!("group {group} on {stream}")))?;

        let slice = |state: &State, offset: usize| -> Vec<(EntryId, EventEnvelope)> {
            state.entries.iter().skip(offset).take(count).cloned().collect()
        };

        let ready = slice(&state, offset);
        if !ready.is_empty() || block.is_zero() {
            return Ok(ready);
        }

        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(state);

        match tokio::time::timeout(block, notified).await {
            Ok(()) => {
                let state = self.inner.state.lock().await;
                let offset = state.offsets.get(&key).copied().unwrap_or(offset);
                Ok(slice(&state, offset))
            }
            Err(_) => Ok(Vec::new()),
        }
    }

    async fn group_ack(&self, stream: &str, group: &str, entry: &str) -> Result<(), LogError> {
        let key = (stream.to_owned(), group.to_owned());
        let mut state = self.inner.state.lock().await;
        if !state.offsets.contains_key(&key) {
            return Err(LogError::NotFound(format!("group {group} on {stream}")));
        }
        let acked = state
            .entries
            .iter()
            .position(|(entry_id, _)| entry_id == entry)
            .map(|index| index + 1);
        if let Some(next) = acked {
            let offset = state.offsets.entry(key).or_insert(0);
            // Never move backwards; out-of-order acks leave gaps behind.
            if next > *offset {
                *offset = next;
            }
        }
        Ok(())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), LogError> {
        let mut state = self.inner.state.lock().await;
        state
            .offsets
            .entry((stream.to_owned(), group.to_owned()))
            .or_insert(0);
        Ok(())
    }
}
