use std::convert::Infallible;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::{run_bridge, StreamTransport, TransportClosed};
use crate::client::SyncSnapshot;
use crate::session::{resolve_sse_cursor, Session, StreamQuery};
use crate::AppState;

pub const EVENT_NAME: &str = "sync";

pub async fn events_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Response {
    info!("eventsource stream request");

    let client = state.sync_client(&headers, &query);
    let cursor = resolve_sse_cursor(&headers, &query);
    // No inbound channel on this transport: presence and filter come only
    // from the initial request and ride along on every poll.
    let mut session = Session::new(cursor, query.filter.clone(), query.presence.clone());

    // Baseline snapshot before any streaming headers go out, so an upstream
    // failure is relayed as a plain HTTP response.
    let first = match client.sync(&session, true).await {
        Ok(first) => first,
        Err(err) => return err.into_response(),
    };

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);
    let cancel = CancellationToken::new();

    let watcher_tx = tx.clone();
    let watcher_cancel = cancel.clone();
    tokio::spawn(async move {
        // Detached closure observer: a dropped receiver means the client went
        // away. Cancelling here does not abort an in-flight poll; the loop
        // honors the token at the next iteration boundary.
        let watcher = tokio::spawn(async move {
            watcher_tx.closed().await;
            debug!("eventsource client disconnected");
            watcher_cancel.cancel();
        });

        let mut transport = SseTransport { tx };
        run_bridge(&client, &mut session, first, &mut transport, &cancel).await;

        // drops the watcher's sender clone so the response stream ends
        watcher.abort();
        debug!("eventsource bridge ended");
    });

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

struct SseTransport {
    tx: mpsc::Sender<Result<Event, Infallible>>,
}

#[async_trait]
impl StreamTransport for SseTransport {
    /// One event per cycle: the id line carries the cursor, the data line the
    /// payload with the cursor removed. Events are flushed as they are sent.
    async fn emit(&mut self, snapshot: &SyncSnapshot) -> Result<(), TransportClosed> {
        let event = Event::default()
            .id(&snapshot.next_batch)
            .event(EVENT_NAME)
            .data(strip_cursor(&snapshot.body));
        self.tx.send(Ok(event)).await.map_err(|_| TransportClosed)
    }
}

/// Remove `next_batch` from the payload. Every other top-level field, known
/// or unknown, passes through as received; the id: line is this transport's
/// resumption point, so the cursor must not also appear in the data.
fn strip_cursor(body: &Map<String, Value>) -> String {
    let mut data = body.clone();
    // shift_remove keeps the remaining fields in their original order
    data.shift_remove("next_batch");
    Value::Object(data).to_string()
}
