use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a session was abandoned. Every abort returns the device to the join screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Status poll failed at the transport or decode level
    SessionLost(String),
    /// Server reported a stage that is not valid from the current one
    UnexpectedStage { expected: String, observed: String },
    /// Clock handshake gave up before the reaction-time window
    HandshakeFailed(String),
    /// The local user left the session
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::SessionLost(msg) => write!(f, "session lost: {}", msg),
            AbortReason::UnexpectedStage { expected, observed } => {
                write!(f, "unexpected stage {} while expecting {}", observed, expected)
            }
            AbortReason::HandshakeFailed(msg) => write!(f, "handshake failed: {}", msg),
            AbortReason::Cancelled => write!(f, "cancelled by user"),
        }
    }
}

/// Rewatch client error types
#[derive(Error, Debug, Clone)]
pub enum RewatchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error: HTTP {0}")]
    Server(u16),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake failed after {failures} consecutive network failures")]
    HandshakeFailed { failures: u32 },

    #[error("Handshake timed out after {0:?} waiting for a rendezvous")]
    HandshakeTimeout(Duration),

    #[error("Session aborted: {0}")]
    SessionAborted(AbortReason),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Capture window already open")]
    AlreadyCapturing,

    #[error("No capture window open")]
    NotCapturing,

    #[error("Sensor failed: {0}")]
    Sensor(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RewatchError {
    /// Failures worth re-issuing the same request for: transport errors and 5xx answers
    pub fn is_retryable(&self) -> bool {
        match self {
            RewatchError::Network(_) => true,
            RewatchError::Server(code) => *code >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RewatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RewatchError::Protocol(err.to_string())
        } else if let Some(status) = err.status() {
            RewatchError::Server(status.as_u16())
        } else {
            RewatchError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RewatchError {
    fn from(err: serde_json::Error) -> Self {
        RewatchError::Protocol(err.to_string())
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, RewatchError>;
