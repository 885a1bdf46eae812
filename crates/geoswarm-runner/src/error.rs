//! Error types for the swarm runner.
//!
//! [`TransportError`] is the one error type drivers see from the realtime
//! transport. [`TransportError::is_fatal`] separates errors that end an
//! entity's session from errors absorbed until the next tick.

/// Errors surfaced by a [`Transport`](crate::transport::Transport) or
/// [`Socket`](crate::transport::Socket).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The realtime connection could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A remote procedure returned an error.
    #[error("remote call {procedure} failed: {message}")]
    RemoteCall {
        /// The procedure that failed.
        procedure: String,
        /// Error text from the server or client library.
        message: String,
    },

    /// A remote call did not complete in time.
    #[error("remote call {procedure} timed out after {after_ms}ms")]
    Timeout {
        /// The procedure that timed out.
        procedure: String,
        /// The timeout that elapsed.
        after_ms: u64,
    },

    /// An inbound event could not be decoded.
    #[error("malformed {kind} event: {message}")]
    MalformedEvent {
        /// Event kind (`stream`, `presence` or `notification`).
        kind: &'static str,
        /// Decode error text.
        message: String,
    },

    /// The socket was closed underneath the caller.
    #[error("socket closed")]
    Closed,
}

impl TransportError {
    /// Whether this error ends the entity's session.
    ///
    /// Remote-call failures, timeouts and malformed events are absorbed;
    /// the next tick retries whatever was missed.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Connect(_) | Self::Closed)
    }

    /// Build a [`TransportError::RemoteCall`].
    pub fn remote_call(procedure: &str, message: impl std::fmt::Display) -> Self {
        Self::RemoteCall {
            procedure: procedure.to_owned(),
            message: message.to_string(),
        }
    }
}
