use async_trait::async_trait;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{run_bridge, StreamTransport, TransportClosed};
use crate::client::{SyncClient, SyncSnapshot};
use crate::errors::SyncError;
use crate::session::{Session, StreamQuery};
use crate::AppState;

/// Sub-protocol negotiated during the upgrade.
pub const SUBPROTOCOL: &str = "m.json";

/// Control frames accepted from the client. Anything that fails to parse is
/// logged and discarded; it never terminates the connection.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    SetPresence { presence: String },
}

pub async fn stream_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Response {
    info!("websocket stream request");

    let client = state.sync_client(&headers, &query);
    // Presence on this endpoint is a one-shot update at accept time; later
    // changes arrive as control frames. It is not a per-poll parameter.
    let session = Session::new(query.since.clone(), query.filter.clone(), None);
    if let Some(presence) = query.presence.clone().filter(|p| !p.is_empty()) {
        let presence_client = client.clone();
        tokio::spawn(async move { presence_client.update_presence(&presence).await });
    }

    // The baseline snapshot is fetched before the upgrade so a failing
    // upstream surfaces as a plain HTTP error, never a broken socket.
    match client.sync(&session, true).await {
        Ok(first) => match ws {
            Ok(ws) => ws
                .protocols([SUBPROTOCOL])
                .on_upgrade(move |socket| handle_socket(socket, client, session, first)),
            Err(rejection) => rejection.into_response(),
        },
        Err(err) => err.into_response(),
    }
}

async fn handle_socket(
    socket: WebSocket,
    client: SyncClient,
    mut session: Session,
    first: SyncSnapshot,
) {
    let (sender, receiver) = socket.split();
    let cancel = CancellationToken::new();

    // Inbound observer: handles control frames and flips the cancellation
    // token when the client closes. The bridge loop only consults the token
    // between cycles, never while a frame write is in progress.
    let reader_cancel = cancel.clone();
    let reader_client = client.clone();
    let reader = tokio::spawn(async move {
        read_control_frames(receiver, reader_client).await;
        reader_cancel.cancel();
    });

    let mut transport = WsTransport { sender };
    run_bridge(&client, &mut session, first, &mut transport, &cancel).await;

    let _ = transport.sender.close().await;
    reader.abort();
    debug!("websocket bridge ended");
}

async fn read_control_frames(mut receiver: SplitStream<WebSocket>, client: SyncClient) {
    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "websocket read error");
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ControlMessage>(&text) {
                Ok(ControlMessage::SetPresence { presence }) => {
                    client.update_presence(&presence).await;
                }
                Err(err) => {
                    warn!(error = %err, "discarding unparseable control frame");
                }
            },
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            // ping/pong handled by the ws layer, binary frames ignored
            _ => {}
        }
    }
}

struct WsTransport {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl StreamTransport for WsTransport {
    /// The raw upstream body goes out untouched, `next_batch` inline: this
    /// transport's client reads its resumption point out of the payload.
    async fn emit(&mut self, snapshot: &SyncSnapshot) -> Result<(), TransportClosed> {
        self.sender
            .send(Message::Text(snapshot.raw.clone()))
            .await
            .map_err(|_| TransportClosed)
    }

    /// The connection is already upgraded, so a failed cycle cannot surface
    /// as an HTTP status; close with a best-effort diagnostic instead.
    async fn close(&mut self, error: &SyncError) {
        let _ = self
            .sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::ERROR,
                reason: close_reason(error).into(),
            })))
            .await;
    }
}

/// Close-frame reasons are capped at 123 bytes; truncate on a UTF-8 boundary
/// so an oversized upstream message cannot make the close itself fail.
fn close_reason(error: &SyncError) -> String {
    let mut reason = match error {
        SyncError::Internal(_) => "internal bridge error".to_string(),
        other => other.to_string(),
    };
    if reason.len() > 123 {
        let mut end = 123;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn close_reason_fits_frame_limit_with_multibyte_message() {
        let err = SyncError::Business {
            status: 429,
            content_type: Some("application/json".into()),
            body: Bytes::new(),
            code: "M_LIMIT_EXCEEDED".into(),
            message: "слишком много запросов, попробуйте позже".repeat(4),
        };
        let reason = close_reason(&err);
        assert!(reason.len() <= 123, "reason is {} bytes", reason.len());
        // String invariants guarantee the cut landed on a char boundary;
        // a short reason passes through untouched
        let short = SyncError::Transport {
            status: 502,
            content_type: None,
            body: Bytes::new(),
        };
        assert_eq!(close_reason(&short), short.to_string());
    }

    #[test]
    fn close_reason_never_leaks_internal_detail() {
        let err = SyncError::internal("next_batch missing from payload");
        assert_eq!(close_reason(&err), "internal bridge error");
    }
}
