use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{SyncClient, SyncSnapshot};
use crate::errors::SyncError;
use crate::session::Session;

/// The client side of the connection is gone; the bridge must stop polling.
#[derive(Debug)]
pub struct TransportClosed;

/// Capability surface a transport offers to the bridge loop. Both adapters
/// share the loop and differ only in how a cycle is framed on the wire.
#[async_trait]
pub trait StreamTransport: Send {
    /// Deliver one successful sync cycle to the client.
    async fn emit(&mut self, snapshot: &SyncSnapshot) -> Result<(), TransportClosed>;

    /// Best-effort teardown after a failed cycle. The connection is already
    /// streaming at this point, so no HTTP status can be written.
    async fn close(&mut self, _error: &SyncError) {}
}

/// Drive one connection: emit the already-fetched initial snapshot, then
/// repeat long-poll cycles until a failure, an emit error, or cancellation.
///
/// Each successful cycle advances the session cursor to its `next_batch`
/// before anything else happens, so the next poll always resumes exactly
/// where the last one left off. The cancellation token is consulted only at
/// iteration boundaries; a cycle in flight always completes its write first.
/// No failure is retried here: recovery is the client's job, via a fresh
/// request carrying the last delivered cursor.
pub async fn run_bridge<T: StreamTransport>(
    client: &SyncClient,
    session: &mut Session,
    first: SyncSnapshot,
    transport: &mut T,
    cancel: &CancellationToken,
) {
    session.cursor = Some(first.next_batch.clone());
    if transport.emit(&first).await.is_err() {
        debug!("client went away before the first frame was delivered");
        return;
    }

    loop {
        if cancel.is_cancelled() {
            debug!("client closed the connection; stopping poll loop");
            return;
        }
        match client.sync(session, false).await {
            Ok(snapshot) => {
                session.cursor = Some(snapshot.next_batch.clone());
                if transport.emit(&snapshot).await.is_err() {
                    debug!("client went away; stopping poll loop");
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "sync cycle failed; terminating bridge");
                transport.close(&err).await;
                return;
            }
        }
    }
}
