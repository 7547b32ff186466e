use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::stream::SplitSink;
use tokio::sync::{Mutex, mpsc};

use super::SessionEvent;

pub type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Handle to one live connection, reachable from outside its owning task.
/// The heartbeat sweep pings through `sender` and wakes the owner through
/// `events` when the connection goes stale.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub sender: WsSender,
    /// Cleared by the sweep, re-set by any inbound frame.
    pub alive: Arc<AtomicBool>,
    pub events: mpsc::Sender<SessionEvent>,
}

impl ConnectionHandle {
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Clears the liveness flag, returning whether it was set. A `false`
    /// return means no frame arrived since the previous sweep.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }
}

/// Tracks all live connections by connection id.
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    pub fn add(&self, connection_id: String, handle: ConnectionHandle) {
        self.connections.insert(connection_id, handle);
    }

    pub fn remove(&self, connection_id: &str) {
        self.connections.remove(connection_id);
    }

    pub fn get(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of every live handle, taken so the sweep never holds a
    /// map guard across an await.
    pub fn handles(&self) -> Vec<(String, ConnectionHandle)> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
