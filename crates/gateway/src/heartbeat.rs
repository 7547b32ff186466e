use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::SinkExt;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};

use crate::ws::SessionEvent;
use crate::ws::storage::ConnectionRegistry;

/// Periodic liveness sweep. Each tick clears every connection's alive
/// flag and pings it; any inbound frame re-sets the flag. A connection
/// whose flag is already clear at sweep time has been silent for a full
/// interval since the last ping and is force-closed through its event
/// queue, which triggers normal session teardown in the owning task.
pub async fn run_heartbeat(
    connections: Arc<ConnectionRegistry>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    info!(every_secs = every.as_secs(), "heartbeat sweep started");
    loop {
        tokio::select! {
            _ = ticker.tick() => sweep(&connections).await,
            _ = shutdown.changed() => break,
        }
    }
    info!("heartbeat sweep stopped");
}

async fn sweep(connections: &ConnectionRegistry) {
    for (connection_id, handle) in connections.handles() {
        if handle.take_alive() {
            let mut guard = handle.sender.lock().await;
            let _ = guard.send(Message::Ping(Bytes::new())).await;
        } else {
            debug!(%connection_id, "connection stale, expiring");
            // try_send: a full queue means the owner is busy and will be
            // expired by the next sweep instead.
            let _ = handle.events.try_send(SessionEvent::Expired);
        }
    }
}
