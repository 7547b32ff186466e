pub mod handler;
pub mod session;
pub mod storage;

use voxgate_providers::adapter::ProviderEvent;

/// Events funneled into a connection's owning task. Provider callbacks
/// arrive on upstream-driven tasks and are re-queued here so session
/// state only ever has one writer.
#[derive(Debug)]
pub enum SessionEvent {
    Provider {
        session_id: String,
        event: ProviderEvent,
    },
    /// The heartbeat sweep declared this connection dead.
    Expired,
}
