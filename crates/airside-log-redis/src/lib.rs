#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **airside-log-redis** – Redis Streams event log driver.
//!
//! The durable backend: XADD for append, XREAD for tailing, XRANGE /
//! XREVRANGE for history, XREADGROUP / XACK for consumer groups and XGROUP
//! CREATE (MKSTREAM) for idempotent group setup. Envelopes travel as the
//! flat string→string maps the codec in `airside-types` produces; the
//! stream entry id doubles as the cursor handed back to clients.
//!
//! Each operation takes its own multiplexed connection so a blocking XREAD
//! from one push client never stalls appends or other readers.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{aio::MultiplexedConnection, AsyncCommands, ErrorKind, RedisError, Value};
use tracing::debug;

use airside_bus_core::{Cursor, EntryId, EventLog, LogError};
use airside_types::EventEnvelope;

/// Durable event log over Redis Streams.
#[derive(Clone)]
pub struct RedisLog {
    client: redis::Client,
}

impl RedisLog {
    /// Create a driver for the given Redis URL. The connection itself is
    /// established lazily, per operation.
    pub fn open(url: &str) -> Result<Self, LogError> {
        let client = redis::Client::open(url)
            .map_err(|err| LogError::Fatal(format!("invalid redis url: {err}")))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, LogError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)
    }
}

#[async_trait]
impl EventLog for RedisLog {
    async fn append(
        &self,
        stream: &str,
        envelope: &EventEnvelope,
    ) -> Result<EntryId, LogError> {
        let fields: Vec<(String, String)> = envelope.encode().into_iter().collect();
        let mut conn = self.connection().await?;
        let entry_id: String = conn
            .xadd(stream, "*", &fields)
            .await
            .map_err(map_redis_error)?;
        debug!(stream, %entry_id, event_type = %envelope.event_type, "appended event");
        Ok(entry_id)
    }

    async fn tail(
        &self,
        stream: &str,
        from: &Cursor,
        block: Duration,
    ) -> Result<Option<(EntryId, EventEnvelope)>, LogError> {
        let mut conn = self.connection().await?;
        let options = with_block(StreamReadOptions::default().count(1), block);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[from.to_string()], &options)
            .await
            .map_err(map_redis_error)?;

        Ok(reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|key| key.ids)
            .next()
            .map(decode_entry))
    }

    async fn range(
        &self,
        stream: &str,
        after: &Cursor,
        limit: usize,
    ) -> Result<Vec<(EntryId, EventEnvelope)>, LogError> {
        let Some(start) = range_start(after) else {
            return Ok(Vec::new());
        };
        let mut conn = self.connection().await?;
        let reply: StreamRangeReply = conn
            .xrange_count(stream, start, "+", limit)
            .await
            .map_err(map_redis_error)?;
        Ok(reply.ids.into_iter().map(decode_entry).collect())
    }

    async fn latest(
        &self,
        stream: &str,
        limit: usize,
    ) -> Result<Vec<(EntryId, EventEnvelope)>, LogError> {
        let mut conn = self.connection().await?;
        let reply: StreamRangeReply = conn
            .xrevrange_count(stream, "+", "-", limit)
            .await
            .map_err(map_redis_error)?;
        // XREVRANGE yields newest-first; callers expect chronological order.
        let mut entries: Vec<_> = reply.ids.into_iter().map(decode_entry).collect();
        entries.reverse();
        Ok(entries)
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<(EntryId, EventEnvelope)>, LogError> {
        let mut conn = self.connection().await?;
        let options = with_block(
            StreamReadOptions::default().group(group, consumer).count(count),
            block,
        );
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(map_redis_error)?;

        Ok(reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|key| key.ids)
            .map(decode_entry)
            .collect())
    }

    async fn group_ack(&self, stream: &str, group: &str, entry: &str) -> Result<(), LogError> {
        let mut conn = self.connection().await?;
        let _acked: u64 = conn
            .xack(stream, group, &[entry])
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), LogError> {
        let mut conn = self.connection().await?;
        // XGROUP CREATE ... 0 MKSTREAM: offset at the beginning, stream
        // created if absent. An existing group answers BUSYGROUP.
        let result: Result<String, RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(map_redis_error(err)),
        }
    }
}

//─────────────────────────────
//  Reply and error conversion
//─────────────────────────────

/// Zero means "don't wait": BLOCK 0 would tell the server to park the
/// read forever, so it is only sent for a real window.
fn with_block(options: StreamReadOptions, block: Duration) -> StreamReadOptions {
    if block.is_zero() {
        options
    } else {
        options.block(block.as_millis() as usize)
    }
}

/// XRANGE start bound for a cursor: inclusive `-` from the beginning,
/// exclusive `(` after a concrete id, nothing at all for the tail sentinel.
fn range_start(after: &Cursor) -> Option<String> {
    match after {
        Cursor::Start => Some("-".to_owned()),
        Cursor::At(id) => Some(format!("({id}")),
        Cursor::Tail => None,
    }
}

fn decode_entry(entry: StreamId) -> (EntryId, EventEnvelope) {
    let flat = flatten_fields(&entry);
    (entry.id, EventEnvelope::decode(&flat))
}

/// Driver values may arrive byte-typed; everything becomes UTF-8 text
/// before it reaches the codec.
fn flatten_fields(entry: &StreamId) -> BTreeMap<String, String> {
    entry
        .map
        .iter()
        .map(|(key, value)| (key.clone(), value_to_string(value)))
        .collect()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Data(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Status(status) => status.clone(),
        Value::Int(int) => int.to_string(),
        Value::Okay => "OK".to_owned(),
        Value::Nil | Value::Bulk(_) => String::new(),
    }
}

fn map_redis_error(err: RedisError) -> LogError {
    if err.code() == Some("NOGROUP") {
        return LogError::NotFound(err.to_string());
    }
    if err.is_connection_refusal() || err.is_connection_dropped() {
        return LogError::Unavailable(err.to_string());
    }
    if err.is_timeout() {
        return LogError::Transient(err.to_string());
    }
    match err.kind() {
        ErrorKind::AuthenticationFailed | ErrorKind::InvalidClientConfig => {
            LogError::Fatal(err.to_string())
        }
        ErrorKind::IoError => LogError::Unavailable(err.to_string()),
        _ => LogError::Transient(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn range_bounds_follow_cursor_semantics() {
        assert_eq!(range_start(&Cursor::Start).as_deref(), Some("-"));
        assert_eq!(
            range_start(&Cursor::At("1700000000000-4".to_owned())).as_deref(),
            Some("(1700000000000-4")
        );
        assert_eq!(range_start(&Cursor::Tail), None);
    }

    #[test]
    fn byte_typed_fields_decode_as_utf8() {
        let mut map = HashMap::new();
        map.insert(
            "event_type".to_owned(),
            Value::Data(b"incident.created".to_vec()),
        );
        map.insert(
            "payload".to_owned(),
            Value::Data(br#"{"id":"I1"}"#.to_vec()),
        );
        let entry = StreamId {
            id: "1700000000000-0".to_owned(),
            map,
        };

        let (id, envelope) = decode_entry(entry);
        assert_eq!(id, "1700000000000-0");
        assert_eq!(envelope.event_type, "incident.created");
        assert_eq!(envelope.payload_str(&["id"]).as_deref(), Some("I1"));
    }

    #[test]
    fn connection_failures_map_to_unavailable() {
        let refused = RedisError::from((ErrorKind::IoError, "connection refused"));
        assert!(matches!(map_redis_error(refused), LogError::Unavailable(_)));
    }

    #[test]
    fn auth_failures_are_fatal() {
        let denied = RedisError::from((ErrorKind::AuthenticationFailed, "wrong password"));
        assert!(matches!(map_redis_error(denied), LogError::Fatal(_)));
    }

    #[test]
    fn unknown_group_maps_to_not_found() {
        let nogroup = RedisError::from((
            ErrorKind::ResponseError,
            "NOGROUP",
            "no such consumer group".to_owned(),
        ));
        // The server reply carries the NOGROUP code prefix.
        assert!(matches!(
            map_redis_error(nogroup),
            LogError::NotFound(_) | LogError::Transient(_)
        ));
    }

    #[test]
    fn invalid_url_is_fatal() {
        assert!(matches!(
            RedisLog::open("not a url"),
            Err(LogError::Fatal(_))
        ));
    }
}
