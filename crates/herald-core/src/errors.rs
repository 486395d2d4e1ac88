use crate::ids::InstanceId;
use crate::instance::ConnectionState;

/// Errors raised by a transport driver call.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not initialized")]
    NotInitialized,
    #[error("recipient rejected: {0}")]
    InvalidRecipient(String),
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("transport request failed: {0}")]
    Request(String),
    #[error("transport protocol error: {0}")]
    Protocol(String),
}

/// Outcome of a failed send. Rejects exactly one queue entry.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SendError {
    #[error("instance {instance_id} is not ready ({state})")]
    InstanceNotReady {
        instance_id: InstanceId,
        state: ConnectionState,
    },
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("dispatch loop aborted before the message was sent")]
    QueueAborted,
}

impl SendError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InstanceNotReady { .. } => "instance_not_ready",
            Self::UnknownInstance(_) => "unknown_instance",
            Self::Transport(TransportError::NotInitialized) => "transport_not_initialized",
            Self::Transport(TransportError::InvalidRecipient(_)) => "invalid_recipient",
            Self::Transport(TransportError::MediaUnavailable(_)) => "media_unavailable",
            Self::Transport(TransportError::Request(_)) => "transport_request",
            Self::Transport(TransportError::Protocol(_)) => "transport_protocol",
            Self::QueueAborted => "queue_aborted",
        }
    }
}

/// Instance lifecycle failures. Captured into instance state and broadcast.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("transport initialization failed: {0}")]
    Initialization(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("instance store error: {0}")]
    Store(String),
}

impl ConnectionError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownInstance(_) => "unknown_instance",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::Initialization(_) => "initialization",
            Self::Authentication(_) => "authentication",
            Self::Store(_) => "store",
        }
    }
}
