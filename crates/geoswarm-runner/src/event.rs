//! Decoding of raw inbound payloads.

use serde::de::DeserializeOwned;

use crate::error::TransportError;
use crate::transport::InboundEvent;

impl InboundEvent {
    /// Short label for logs and error messages.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StreamData { .. } => "stream",
            Self::Presence { .. } => "presence",
            Self::Notification { .. } => "notification",
        }
    }
}

/// Decode a JSON payload of an inbound event of the given `kind`.
///
/// # Errors
///
/// Returns [`TransportError::MalformedEvent`] if the payload does not
/// parse as `T`.
pub fn decode<T: DeserializeOwned>(kind: &'static str, payload: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(payload).map_err(|e| TransportError::MalformedEvent {
        kind,
        message: e.to_string(),
    })
}

/// Decode a JSON value returned by a remote call.
///
/// # Errors
///
/// Returns [`TransportError::RemoteCall`] if the value does not have the
/// expected shape.
pub fn decode_result<T: DeserializeOwned>(
    procedure: &str,
    value: serde_json::Value,
) -> Result<T, TransportError> {
    serde_json::from_value(value).map_err(|e| TransportError::remote_call(procedure, e))
}
