//! The boundary between drivers and the realtime backend.
//!
//! A [`Transport`] issues sessions and opens sockets; a [`Socket`] carries
//! remote calls out and an inbound event stream in. Both are object safe
//! so the swarm can hold `Arc<dyn Transport>` and each driver a
//! `Box<dyn Socket>`. Implementations:
//!
//! - [`NatsTransport`](crate::nats::NatsTransport) -- NATS pub/sub
//! - [`LoopbackTransport`](crate::loopback::LoopbackTransport) -- in-process

use async_trait::async_trait;
use geoswarm_types::{Cell, EntityId, GroupInfo};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Capacity of each socket's inbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Account credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account identity (an email address for simulated entities).
    pub identity: String,
    /// Account secret.
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// The entity this session belongs to.
    pub entity_id: EntityId,
    /// Opaque bearer token for opening sockets.
    pub token: String,
    /// The identity the session was issued for.
    pub identity: String,
    /// The group the server placed the entity in, if any.
    #[serde(default)]
    pub group: Option<GroupInfo>,
}

/// The stream an inbound event arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRef {
    /// A cell stream joined through `rpcjoincell`.
    Cell(Cell),
    /// A group broadcast stream, by group name.
    Group(String),
}

/// An event pushed by the backend. Payloads stay raw until decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A position message on a cell or group stream.
    StreamData {
        /// Stream the message arrived on.
        stream: StreamRef,
        /// JSON-encoded `StreamMessage`.
        payload: Vec<u8>,
    },
    /// Joins and leaves on a stream.
    Presence {
        /// Stream whose membership changed.
        stream: StreamRef,
        /// JSON-encoded `PresenceEvent`.
        payload: Vec<u8>,
    },
    /// A notification addressed to this entity.
    Notification {
        /// Notification subject, e.g. `buildings_update`.
        subject: String,
        /// JSON-encoded notification content.
        content: Vec<u8>,
    },
}

/// Issues sessions and opens sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Authenticate `credentials`, creating the account when allowed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Auth`] on rejected credentials.
    async fn authenticate(
        &self,
        credentials: &Credentials,
        create_if_missing: bool,
    ) -> Result<Session, TransportError>;

    /// Open a realtime socket for `session`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the socket cannot be opened.
    async fn connect(&self, session: &Session) -> Result<Box<dyn Socket>, TransportError>;
}

/// One entity's realtime connection.
#[async_trait]
pub trait Socket: Send {
    /// Invoke `procedure` with a JSON payload and return its JSON result.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::RemoteCall`] if the procedure fails, or
    /// [`TransportError::Closed`] if the socket is closed.
    async fn remote_call(
        &mut self,
        procedure: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;

    /// Take the inbound event stream. Returns `Some` exactly once.
    fn take_events(&mut self) -> Option<mpsc::Receiver<InboundEvent>>;

    /// Close the socket. Further calls fail with [`TransportError::Closed`].
    async fn close(&mut self);
}
