use thiserror::Error;

/// Errors a tool-surface operation can fail with. The MCP layer maps these
/// onto `validation_error` (bad input, caller's fault) vs `tool_error`
/// (the operation was well-formed but could not complete).
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("session is not connected")]
    NotConnected,
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),
    #[error("join token rejected: {0}")]
    JoinRejected(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("state key not found: {0}")]
    UnknownStateKey(String),
    #[error("transport error: {0}")]
    Transport(#[from] bridge_transport::TransportError),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// True when the caller handed us something malformed, as opposed to the
    /// request being well-formed but failing for operational reasons.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidArgument(_) | BridgeError::UnknownSession(_)
        )
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
