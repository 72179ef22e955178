//! Error taxonomy (§7). Every fallible boundary in the gateway returns one of
//! these variants; the Router is the only place that converts a `GatewayError`
//! into a wire-level reply, via `user_message()` and each handler's own
//! `*:error` envelope. Each variant carries enough structured context
//! (`session_id`, an operation name, the underlying error via `#[source]`)
//! that `user_message()` and `log()` both read off the one value instead of
//! formatting the failure twice.

use crate::session::SessionId;
use thiserror::Error;

type Source = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed message: {message}")]
    Protocol {
        message: String,
        operation: Option<String>,
        #[source]
        source: Option<Source>,
    },

    #[error("precondition not met: {message}")]
    Precondition {
        message: String,
        operation: Option<String>,
        session_id: Option<SessionId>,
    },

    #[error("transport failure: {message}")]
    Transport {
        message: String,
        session_id: Option<SessionId>,
        #[source]
        source: Option<Source>,
    },

    #[error("shell failure: {message}")]
    Shell {
        message: String,
        session_id: Option<SessionId>,
        #[source]
        source: Option<Source>,
    },

    #[error("remote command failed: {message}")]
    RemoteCommand {
        message: String,
        operation: Option<String>,
        session_id: Option<SessionId>,
    },

    #[error("io error: {message}")]
    Io {
        message: String,
        operation: Option<String>,
        session_id: Option<SessionId>,
        #[source]
        source: Option<Source>,
    },

    #[error("operation timed out: {message}")]
    Timeout {
        message: String,
        operation: Option<String>,
        session_id: Option<SessionId>,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Source>,
    },
}

impl GatewayError {
    /// Human message surfaced in the wire-level `*:error` payload.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol { message: msg.into(), operation: None, source: None }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition { message: msg.into(), operation: None, session_id: None }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport { message: msg.into(), session_id: None, source: None }
    }

    pub fn transport_src(msg: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport { message: msg.into(), session_id: None, source: Some(Box::new(source)) }
    }

    pub fn shell(msg: impl Into<String>) -> Self {
        Self::Shell { message: msg.into(), session_id: None, source: None }
    }

    pub fn remote_command(msg: impl Into<String>) -> Self {
        Self::RemoteCommand { message: msg.into(), operation: None, session_id: None }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io { message: msg.into(), operation: None, session_id: None, source: None }
    }

    pub fn io_src(msg: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Io { message: msg.into(), operation: None, session_id: None, source: Some(Box::new(source)) }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout { message: msg.into(), operation: None, session_id: None }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into(), source: None }
    }

    pub fn internal_src(msg: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal { message: msg.into(), source: Some(Box::new(source)) }
    }

    /// Attach the operation name this error occurred under (e.g. `"readdir"`,
    /// `"upload_chunk"`), so the one value can build both the wire reply and
    /// the log record. No-op on variants that don't carry an operation slot.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        match &mut self {
            Self::Protocol { operation: o, .. }
            | Self::Precondition { operation: o, .. }
            | Self::RemoteCommand { operation: o, .. }
            | Self::Io { operation: o, .. }
            | Self::Timeout { operation: o, .. } => *o = Some(operation),
            Self::Transport { .. } | Self::Shell { .. } | Self::Internal { .. } => {}
        }
        self
    }

    /// Attach the owning session, once one exists. No-op on variants raised
    /// before any session is bound (malformed frames, protocol errors).
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        match &mut self {
            Self::Precondition { session_id: s, .. }
            | Self::Transport { session_id: s, .. }
            | Self::Shell { session_id: s, .. }
            | Self::RemoteCommand { session_id: s, .. }
            | Self::Io { session_id: s, .. }
            | Self::Timeout { session_id: s, .. } => *s = Some(session_id),
            Self::Protocol { .. } | Self::Internal { .. } => {}
        }
        self
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::Precondition { session_id, .. }
            | Self::Transport { session_id, .. }
            | Self::Shell { session_id, .. }
            | Self::RemoteCommand { session_id, .. }
            | Self::Io { session_id, .. }
            | Self::Timeout { session_id, .. } => *session_id,
            Self::Protocol { .. } | Self::Internal { .. } => None,
        }
    }

    pub fn operation(&self) -> Option<&str> {
        match self {
            Self::Protocol { operation, .. }
            | Self::Precondition { operation, .. }
            | Self::RemoteCommand { operation, .. }
            | Self::Io { operation, .. }
            | Self::Timeout { operation, .. } => operation.as_deref(),
            Self::Transport { .. } | Self::Shell { .. } | Self::Internal { .. } => None,
        }
    }

    /// Emit the `tracing::error!` record for this failure. Reads `session_id`,
    /// `operation` and the `#[source]` error off this same value rather than
    /// re-deriving them, so callers never format the failure a second time.
    pub fn log(&self) {
        use std::error::Error as _;
        let source = self.source().map(ToString::to_string);
        match (self.session_id(), self.operation(), source) {
            (Some(sid), Some(op), Some(src)) => {
                tracing::error!(session_id = %sid, operation = op, source = %src, error = %self, "gateway error")
            }
            (Some(sid), Some(op), None) => {
                tracing::error!(session_id = %sid, operation = op, error = %self, "gateway error")
            }
            (Some(sid), None, Some(src)) => {
                tracing::error!(session_id = %sid, source = %src, error = %self, "gateway error")
            }
            (Some(sid), None, None) => tracing::error!(session_id = %sid, error = %self, "gateway error"),
            (None, Some(op), Some(src)) => {
                tracing::error!(operation = op, source = %src, error = %self, "gateway error")
            }
            (None, Some(op), None) => tracing::error!(operation = op, error = %self, "gateway error"),
            (None, None, Some(src)) => tracing::error!(source = %src, error = %self, "gateway error"),
            (None, None, None) => tracing::error!(error = %self, "gateway error"),
        }
    }
}

impl From<ssh2::Error> for GatewayError {
    fn from(e: ssh2::Error) -> Self {
        let message = e.to_string();
        GatewayError::Transport { message, session_id: None, source: Some(Box::new(e)) }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        let message = e.to_string();
        GatewayError::Io { message, operation: None, session_id: None, source: Some(Box::new(e)) }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        let message = e.to_string();
        GatewayError::Protocol { message, operation: None, source: Some(Box::new(e)) }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
