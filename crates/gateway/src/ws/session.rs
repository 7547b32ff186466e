use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use voxgate_providers::adapter::{ProviderAdapter, ProviderStream, ServiceKind};

use crate::error::GatewayError;

/// Mints a session identifier embedding the owning identity. Later
/// control frames referencing the id can be authorization-checked by
/// parsing it back, with no lookup table involved.
pub fn mint_session_id(identity: &str, kind: ServiceKind) -> String {
    format!(
        "{identity}:{}:{}",
        kind.code(),
        chrono::Utc::now().timestamp_millis()
    )
}

/// Extracts the owning identity from a session id, or `None` when the id
/// is not in the minted shape. Identities may themselves contain `:` so
/// the id is parsed from the right.
pub fn session_owner(session_id: &str) -> Option<&str> {
    let mut parts = session_id.rsplitn(3, ':');
    let millis = parts.next()?;
    let kind = parts.next()?;
    let identity = parts.next()?;
    if millis.parse::<i64>().is_err() || ServiceKind::from_code(kind).is_none() {
        return None;
    }
    Some(identity)
}

/// Authorization check for a frame referencing `session_id`. An id owned
/// by a different identity is denied; an id that does not parse at all
/// cannot belong to anyone and reads as an invalid session.
pub fn authorize(session_id: &str, identity: &str) -> Result<(), GatewayError> {
    match session_owner(session_id) {
        Some(owner) if owner == identity => Ok(()),
        Some(_) => Err(GatewayError::AccessDenied),
        None => Err(GatewayError::InvalidSession),
    }
}

/// A streaming unit of work, exclusively owned by its connection's task.
/// The provider stream handle is never shared; results flow back through
/// the event queue instead.
pub struct ActiveSession {
    pub id: String,
    pub kind: ServiceKind,
    pub provider: Arc<dyn ProviderAdapter>,
    pub model: String,
    pub sample_rate: u32,
    pub started: Instant,
    pub stream: Box<dyn ProviderStream>,
    /// Accumulated final transcript or completion content.
    pub content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub audio_seconds: f64,
    /// Task pumping provider events into the connection's event queue.
    pub forwarder: AbortHandle,
}

#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub connection_id: String,
    pub kind: ServiceKind,
}

/// Live-session table. The connection task owns the session itself; this
/// table exists for liveness counts and for the exactly-once teardown
/// guard: `remove` returns the meta to the first caller only, so the
/// client-stop path and the connection-close path cannot both record
/// usage for the same session.
pub struct SessionTable {
    live: DashMap<String, SessionMeta>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            live: DashMap::new(),
        }
    }

    pub fn insert(&self, session_id: String, meta: SessionMeta) {
        self.live.insert(session_id, meta);
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionMeta> {
        self.live.remove(session_id).map(|(_, meta)| meta)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.live.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
