use thiserror::Error;
use voxgate_providers::adapter::ProviderError;
use voxgate_services::auth::AuthError;

/// Everything that can go wrong while serving one connection. The
/// `Display` text of each variant is what the client sees in an `error`
/// frame, so the wording here is part of the wire contract.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing, invalid or expired token. Terminates the connection.
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    /// Session id referencing another identity. Frame ignored, the
    /// connection survives.
    #[error("Access denied")]
    AccessDenied,

    #[error("Provider does not support streaming")]
    UnsupportedCapability,

    /// Admission window exhausted; carries the retry-after hint.
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    AdmissionRejected { retry_after_secs: u64 },

    /// Provider connect or send failure. The session is torn down and the
    /// client notified.
    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    /// Unknown or already-closed session id.
    #[error("Invalid session")]
    InvalidSession,

    #[error("Invalid message format")]
    MalformedFrame,
}

impl From<AuthError> for GatewayError {
    fn from(e: AuthError) -> Self {
        GatewayError::AuthenticationFailure(e.to_string())
    }
}

impl From<ProviderError> for GatewayError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::UnsupportedCapability => GatewayError::UnsupportedCapability,
            ProviderError::Upstream(msg) => GatewayError::UpstreamFailure(msg),
            other => GatewayError::UpstreamFailure(other.to_string()),
        }
    }
}
