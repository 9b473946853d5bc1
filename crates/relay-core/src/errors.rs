use std::time::Duration;

/// Failure on a single connection's transport. Always terminal for that
/// connection and never propagated to other members.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("idle for {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Short classification string for log fields.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
            Self::Timeout(_) => "timeout",
        }
    }

    /// A clean close from the peer, as opposed to a broken transport.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("broadcast queue closed")]
    Closed,
}
