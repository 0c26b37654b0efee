//! Event history and the operator push channel.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use airside_bus_core::{Cursor, EventBus};

use crate::error::ApiError;
use crate::state::AppState;

/// Bounds on the `/events` page size.
const LIMIT_MIN: usize = 1;
const LIMIT_MAX: usize = 1000;
const LIMIT_DEFAULT: usize = 50;

/// Back-off after a transport failure inside the push loop.
const STREAM_RETRY: Duration = Duration::from_secs(1);

//─────────────────────────────
//  GET /events
//─────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct EventsQuery {
    since: Option<String>,
    limit: Option<String>,
}

/// Cursored history over the global stream.
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = match query.limit.as_deref() {
        None => LIMIT_DEFAULT,
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|n| (LIMIT_MIN..=LIMIT_MAX).contains(n))
            .ok_or_else(|| {
                ApiError::validation(
                    "limit must be an integer between 1 and 1000",
                    Some(json!({ "limit": raw })),
                )
            })?,
    };

    let page = state.bus.list_events(query.since.as_deref(), limit).await?;
    Ok(Json(json!({
        "items": page.items,
        "next_cursor": page.next_cursor,
    })))
}

//─────────────────────────────
//  GET /stream/ops
//─────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct StreamQuery {
    since: Option<String>,
}

/// Long-lived Server-Sent Events push channel.
///
/// The initial cursor comes from `Last-Event-ID` (reconnect), then
/// `?since=`, else `$` (only new entries). Every delivered entry advances
/// the cursor so a reconnect via the header resumes without a gap. On tail
/// timeout the channel stays warm with a keep-alive: a comment on the
/// durable backend, an explicit `heartbeat` event in demo mode.
pub async fn stream_ops(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Sse<UnboundedReceiverStream<Result<Event, Infallible>>> {
    let initial = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or(query.since)
        .unwrap_or_else(|| "$".to_owned());

    let (tx, rx) = unbounded_channel::<Result<Event, Infallible>>();
    let bus = state.bus.clone();
    let block = state.block;

    tokio::spawn(async move {
        let mut cursor = Cursor::parse(&initial);
        loop {
            // Client gone? The receiver side is dropped with the response.
            if tx.is_closed() {
                break;
            }
            match bus.tail_for_push(&cursor, block).await {
                Ok(Some((entry_id, envelope))) => {
                    let data = serde_json::to_string(&envelope)
                        .unwrap_or_else(|_| "{}".to_owned());
                    let event = Event::default()
                        .id(entry_id.clone())
                        .event(envelope.event_type.clone())
                        .data(data);
                    cursor = Cursor::At(entry_id);
                    if tx.send(Ok(event)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    if tx.send(Ok(keep_alive(&bus))).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "push stream read failed, backing off");
                    tokio::time::sleep(STREAM_RETRY).await;
                }
            }
        }
    });

    Sse::new(UnboundedReceiverStream::new(rx))
}

fn keep_alive(bus: &EventBus) -> Event {
    if bus.is_in_memory() {
        // Demo mode announces itself so consoles can show a banner.
        Event::default().event("heartbeat").data(
            json!({
                "timestamp": Utc::now().to_rfc3339(),
                "mode": "demo",
            })
            .to_string(),
        )
    } else {
        Event::default().comment("keep-alive")
    }
}
