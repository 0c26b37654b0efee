#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **airside-types** – Canonical event envelope and identifier policy for the
//! airside operations backend.
//!
//! Every signal that moves through the system - fleet telemetry, incidents,
//! ticket lifecycle, identity notifications - travels as an [`EventEnvelope`].
//! This crate defines that envelope, the flat-map codec used by the durable
//! log (which only accepts string→string fields), and the deterministic
//! mapping between public free-form identifiers and the uuids persistence
//! requires.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

//─────────────────────────────
//  Severity
//─────────────────────────────

/// Operational severity carried by every envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine signal.
    #[default]
    Info,
    /// Degraded but operational.
    Warning,
    /// Requires immediate operator attention.
    Critical,
}

impl Severity {
    /// Wire representation, always lowercase.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    /// Parse a wire value; anything unrecognised degrades to `info`.
    ///
    /// Producers are inconsistent about casing, so matching is
    /// case-insensitive.
    pub fn parse_lossy(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "warning" => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Event envelope
//─────────────────────────────

/// Field name under which nested entity references are stored on the log.
pub const FIELD_ENTITY_REFS: &str = "entity_refs";
/// Field name under which the domain payload is stored on the log.
pub const FIELD_PAYLOAD: &str = "payload";

/// The canonical event record.
///
/// `entity_refs` maps role names (`incidentId`, `ticketId`, `assetId`,
/// `scenarioRunId`, ...) to **public** identifier strings. `payload` is the
/// domain-specific body. Both are nested structures in memory and JSON text
/// on the durable log. Flat fields the codec does not recognise are kept in
/// `extra` so downstream consumers can still read them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Globally unique identifier, assigned at publish.
    pub event_id: String,
    /// Dotted event name, e.g. `incident.state_changed`.
    pub event_type: String,
    /// Producing bounded context, e.g. `soc`, `ticketing`, `simulation`.
    pub source_context: String,
    /// Operational severity.
    pub severity: Severity,
    /// Publish instant, UTC.
    pub timestamp: DateTime<Utc>,
    /// Carried through causally related events.
    pub correlation_id: String,
    /// Role name → public identifier.
    #[serde(default)]
    pub entity_refs: BTreeMap<String, String>,
    /// Domain-specific body.
    #[serde(default)]
    pub payload: JsonMap<String, JsonValue>,
    /// Unrecognised flat fields, preserved verbatim.
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, String>,
}

impl EventEnvelope {
    /// Encode into the flat string→string map the durable log accepts.
    ///
    /// `entity_refs` and `payload` are serialized as JSON text; every other
    /// field keeps its string form. `extra` fields ride along unchanged.
    pub fn encode(&self) -> BTreeMap<String, String> {
        let mut flat = BTreeMap::new();
        flat.insert("event_id".to_owned(), self.event_id.clone());
        flat.insert("event_type".to_owned(), self.event_type.clone());
        flat.insert("source_context".to_owned(), self.source_context.clone());
        flat.insert("severity".to_owned(), self.severity.as_str().to_owned());
        flat.insert("timestamp".to_owned(), self.timestamp.to_rfc3339());
        flat.insert("correlation_id".to_owned(), self.correlation_id.clone());
        flat.insert(
            FIELD_ENTITY_REFS.to_owned(),
            serde_json::to_string(&self.entity_refs).unwrap_or_else(|_| "{}".to_owned()),
        );
        flat.insert(
            FIELD_PAYLOAD.to_owned(),
            serde_json::to_string(&self.payload).unwrap_or_else(|_| "{}".to_owned()),
        );
        for (k, v) in &self.extra {
            flat.entry(k.clone()).or_insert_with(|| v.clone());
        }
        flat
    }

    /// Decode from a flat map, tolerantly.
    ///
    /// Missing fields become empty strings, unknown severities degrade to
    /// `info`, nested fields that are absent, empty or malformed decode to
    /// empty maps, and a JSON object that is already valid passes through
    /// untouched - so `decode(encode(e))` is the identity for well-formed
    /// envelopes and `decode` is idempotent on its own output.
    pub fn decode(flat: &BTreeMap<String, String>) -> Self {
        let mut envelope = EventEnvelope {
            event_id: String::new(),
            event_type: String::new(),
            source_context: String::new(),
            severity: Severity::Info,
            timestamp: Utc::now(),
            correlation_id: String::new(),
            entity_refs: BTreeMap::new(),
            payload: JsonMap::new(),
            extra: BTreeMap::new(),
        };
        for (key, value) in flat {
            match key.as_str() {
                "event_id" => envelope.event_id = value.clone(),
                "event_type" => envelope.event_type = value.clone(),
                "source_context" => envelope.source_context = value.clone(),
                "severity" => envelope.severity = Severity::parse_lossy(value),
                "timestamp" => {
                    if let Some(ts) = parse_timestamp(value) {
                        envelope.timestamp = ts;
                    }
                }
                "correlation_id" => envelope.correlation_id = value.clone(),
                FIELD_ENTITY_REFS => envelope.entity_refs = parse_string_map(value),
                FIELD_PAYLOAD => envelope.payload = parse_json_object(value),
                _ => {
                    envelope.extra.insert(key.clone(), value.clone());
                }
            }
        }
        envelope
    }

    /// Convenience accessor: first payload value found under any of `keys`,
    /// rendered as a string. Producers are inconsistent about key casing
    /// (`incident_id` vs `incidentId`), so consumers look up several aliases.
    pub fn payload_str(&self, keys: &[&str]) -> Option<String> {
        for key in keys {
            if let Some(value) = self.payload.get(*key) {
                match value {
                    JsonValue::String(s) if !s.trim().is_empty() => {
                        return Some(s.trim().to_owned())
                    }
                    JsonValue::Null => {}
                    JsonValue::String(_) => {}
                    other => return Some(other.to_string()),
                }
            }
        }
        None
    }
}

/// Accepts RFC 3339 as well as the naive ISO form some producers emit.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn parse_string_map(value: &str) -> BTreeMap<String, String> {
    if value.trim().is_empty() {
        return BTreeMap::new();
    }
    match serde_json::from_str::<JsonValue>(value) {
        Ok(JsonValue::Object(obj)) => obj
            .into_iter()
            .map(|(k, v)| {
                let rendered = match v {
                    JsonValue::String(s) => s,
                    other => other.to_string(),
                };
                (k, rendered)
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn parse_json_object(value: &str) -> JsonMap<String, JsonValue> {
    if value.trim().is_empty() {
        return JsonMap::new();
    }
    match serde_json::from_str::<JsonValue>(value) {
        Ok(JsonValue::Object(obj)) => obj,
        _ => JsonMap::new(),
    }
}

//─────────────────────────────
//  Identifier policy
//─────────────────────────────

/// Map a public free-form identifier onto the uuid persistence requires.
///
/// If the string already parses as a uuid it is used verbatim; otherwise a
/// namespaced v5 uuid is derived from it (DNS namespace, input as name).
/// The mapping is total and deterministic, so `"I1"` or `"VEH-202"` always
/// land on the same row. Events keep carrying the public form; rows store
/// the derived one.
pub fn coerce_uuid(value: &str) -> Uuid {
    Uuid::parse_str(value.trim())
        .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_DNS, value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EventEnvelope {
        let mut entity_refs = BTreeMap::new();
        entity_refs.insert("incidentId".to_owned(), "I1".to_owned());
        let mut payload = JsonMap::new();
        payload.insert("incident_id".to_owned(), JsonValue::String("I1".to_owned()));
        payload.insert("attempt".to_owned(), JsonValue::from(2));
        EventEnvelope {
            event_id: "11111111-1111-4111-8111-111111111111".to_owned(),
            event_type: "incident.state_changed".to_owned(),
            source_context: "soc".to_owned(),
            severity: Severity::Warning,
            timestamp: Utc::now(),
            correlation_id: "C1".to_owned(),
            entity_refs,
            payload,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let envelope = sample();
        let decoded = EventEnvelope::decode(&envelope.encode());
        assert_eq!(decoded.event_id, envelope.event_id);
        assert_eq!(decoded.event_type, envelope.event_type);
        assert_eq!(decoded.severity, Severity::Warning);
        assert_eq!(decoded.correlation_id, "C1");
        assert_eq!(decoded.entity_refs, envelope.entity_refs);
        assert_eq!(decoded.payload, envelope.payload);
        assert_eq!(decoded.timestamp.timestamp(), envelope.timestamp.timestamp());
    }

    #[test]
    fn decode_preserves_unknown_fields() {
        let mut flat = sample().encode();
        flat.insert("shard".to_owned(), "7".to_owned());
        let decoded = EventEnvelope::decode(&flat);
        assert_eq!(decoded.extra.get("shard").map(String::as_str), Some("7"));
        // And they survive a re-encode.
        assert_eq!(decoded.encode().get("shard").map(String::as_str), Some("7"));
    }

    #[test]
    fn decode_tolerates_missing_and_malformed_nested_fields() {
        let mut flat = BTreeMap::new();
        flat.insert("event_type".to_owned(), "fleet.overspeed_detected".to_owned());
        flat.insert(FIELD_PAYLOAD.to_owned(), "not json".to_owned());
        let decoded = EventEnvelope::decode(&flat);
        assert_eq!(decoded.event_type, "fleet.overspeed_detected");
        assert!(decoded.payload.is_empty());
        assert!(decoded.entity_refs.is_empty());
        assert_eq!(decoded.severity, Severity::Info);
    }

    #[test]
    fn decode_is_idempotent() {
        let flat = sample().encode();
        let once = EventEnvelope::decode(&flat);
        let twice = EventEnvelope::decode(&once.encode());
        assert_eq!(once.entity_refs, twice.entity_refs);
        assert_eq!(once.payload, twice.payload);
    }

    #[test]
    fn decode_accepts_naive_timestamps() {
        let mut flat = sample().encode();
        flat.insert("timestamp".to_owned(), "2026-03-01T12:30:00.125".to_owned());
        let decoded = EventEnvelope::decode(&flat);
        assert_eq!(decoded.timestamp.to_rfc3339(), "2026-03-01T12:30:00.125+00:00");
    }

    #[test]
    fn severity_parse_lossy() {
        assert_eq!(Severity::parse_lossy("Critical"), Severity::Critical);
        assert_eq!(Severity::parse_lossy("WARNING"), Severity::Warning);
        assert_eq!(Severity::parse_lossy("weird"), Severity::Info);
        assert_eq!(Severity::parse_lossy(""), Severity::Info);
    }

    #[test]
    fn payload_str_checks_aliases_in_order() {
        let envelope = sample();
        assert_eq!(
            envelope.payload_str(&["id", "incident_id"]).as_deref(),
            Some("I1")
        );
        assert_eq!(envelope.payload_str(&["attempt"]).as_deref(), Some("2"));
        assert_eq!(envelope.payload_str(&["missing"]), None);
    }

    #[test]
    fn coerce_uuid_passthrough_and_derivation() {
        let canonical = "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11";
        assert_eq!(coerce_uuid(canonical).to_string(), canonical);

        let derived = coerce_uuid("I1");
        assert_eq!(derived, coerce_uuid("I1"));
        assert_ne!(derived, coerce_uuid("I2"));
        assert_eq!(derived.get_version(), Some(uuid::Version::Sha1));
    }
}
