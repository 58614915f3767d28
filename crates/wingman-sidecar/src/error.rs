// Wingman sidecar error types
use std::fmt;
use thiserror::Error;

/// Coarse classification of a failed HTTP exchange, decided once when the
/// underlying `reqwest`/IO error is converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    TimedOut,
    ConnectionRefused,
    ConnectionLost,
    DnsFailure,
    NotConnected,
    MalformedResponse,
    Other,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::TimedOut => "timed_out",
            TransportErrorKind::ConnectionRefused => "connection_refused",
            TransportErrorKind::ConnectionLost => "connection_lost",
            TransportErrorKind::DnsFailure => "dns_failure",
            TransportErrorKind::NotConnected => "not_connected",
            TransportErrorKind::MalformedResponse => "malformed_response",
            TransportErrorKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind.as_str())
    }
}

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to spawn sidecar: {0}")]
    Spawn(String),

    #[error("Sidecar process already tracked (pid {0}); stop it first")]
    AlreadyRunning(u32),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// The response had started streaming when the transport failed.
    #[error("Prompt stream interrupted: {0}")]
    StreamInterrupted(TransportError),

    /// Retry budget exhausted while the worker was unreachable. Carries the
    /// last transport failure for logs only.
    #[error("Sidecar not ready: {0}")]
    NotReady(String),

    #[error("Sidecar does not serve {0}; the app and sidecar versions differ")]
    StaleVersion(String),

    #[error("Sidecar request failed ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP {status}")]
    Http { status: u16 },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<TransportError> for SidecarError {
    fn from(err: TransportError) -> Self {
        SidecarError::Transport(err)
    }
}

impl SidecarError {
    /// Stable, user-facing wording. Raw transport text never leaves this crate
    /// through here.
    pub fn user_message(&self) -> String {
        match self {
            SidecarError::Transport(_) | SidecarError::NotReady(_) => {
                "The assistant service is still starting. Please try again in a moment.".to_string()
            }
            SidecarError::StreamInterrupted(_) => {
                "The connection to the assistant service was lost mid-response. Please try again."
                    .to_string()
            }
            SidecarError::StaleVersion(_) => {
                "The assistant service is out of date. Please relaunch the app.".to_string()
            }
            SidecarError::Api { message, .. } => message.clone(),
            SidecarError::Http { status } => {
                format!("The assistant service returned an error (HTTP {status}).")
            }
            SidecarError::UnexpectedResponse(_) | SidecarError::Serialization(_) => {
                "The assistant service returned an unexpected response.".to_string()
            }
            SidecarError::Cancelled => "The request was cancelled.".to_string(),
            SidecarError::Io(_)
            | SidecarError::Spawn(_)
            | SidecarError::AlreadyRunning(_)
            | SidecarError::Config(_) => {
                "The assistant service could not be started.".to_string()
            }
        }
    }
}

impl serde::Serialize for SidecarError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.user_message())
    }
}

pub type Result<T> = std::result::Result<T, SidecarError>;
