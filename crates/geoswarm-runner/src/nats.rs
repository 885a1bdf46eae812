//! NATS-backed realtime transport.
//!
//! All entities share one NATS connection; a [`NatsSocket`] is a logical
//! session on top of it. Subjects, under a configurable prefix:
//!
//! - **Authenticate:** request on `{prefix}.auth`
//! - **Remote procedures:** request on `{prefix}.rpc.{procedure}`
//! - **Cell streams:** `{prefix}.cell.{key}.data` and `{prefix}.cell.{key}.presence`
//! - **Group streams:** `{prefix}.group.{name}`
//! - **Notifications:** `{prefix}.notify.{entity_id}`
//!
//! Joining a cell subscribes to its two subjects and announces the join on
//! the presence subject; leaving unsubscribes and announces the leave.
//! `send_location` publishes straight to the cell (and group) data
//! subjects. Every other procedure is forwarded to the backend as a
//! request.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt as _;
use geoswarm_types::{
    Cell, CellRequest, EntityId, LocationBroadcast, PROC_JOIN_CELL, PROC_LEAVE_CELL,
    PROC_SEND_LOCATION, PresenceEvent, StreamMessage,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::event::decode_result;
use crate::transport::{
    Credentials, EVENT_CHANNEL_CAPACITY, InboundEvent, Session, Socket, StreamRef, Transport,
};

// -----------------------------------------------------------------------
// Subjects
// -----------------------------------------------------------------------

/// Subject naming under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    prefix: String,
}

impl Subjects {
    /// Subjects under `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Authentication request subject.
    pub fn auth(&self) -> String {
        format!("{}.auth", self.prefix)
    }

    /// Request subject of a remote procedure.
    pub fn rpc(&self, procedure: &str) -> String {
        format!("{}.rpc.{procedure}", self.prefix)
    }

    /// Position messages on a cell.
    pub fn cell_data(&self, cell: Cell) -> String {
        format!("{}.cell.{cell}.data", self.prefix)
    }

    /// Presence changes on a cell.
    pub fn cell_presence(&self, cell: Cell) -> String {
        format!("{}.cell.{cell}.presence", self.prefix)
    }

    /// Both subjects of a cell.
    pub fn cell_wildcard(&self, cell: Cell) -> String {
        format!("{}.cell.{cell}.*", self.prefix)
    }

    /// A group's broadcast stream.
    pub fn group(&self, name: &str) -> String {
        format!("{}.group.{name}", self.prefix)
    }

    /// Notifications addressed to one entity.
    pub fn notify(&self, entity: EntityId) -> String {
        format!("{}.notify.{entity}", self.prefix)
    }
}

/// Map a message on a cell subject to an inbound event.
fn cell_event(cell: Cell, subject: &str, payload: Vec<u8>) -> Option<InboundEvent> {
    let stream = StreamRef::Cell(cell);
    if subject.ends_with(".data") {
        Some(InboundEvent::StreamData { stream, payload })
    } else if subject.ends_with(".presence") {
        Some(InboundEvent::Presence { stream, payload })
    } else {
        None
    }
}

// -----------------------------------------------------------------------
// Wire envelopes
// -----------------------------------------------------------------------

#[derive(Serialize)]
struct AuthRequest<'a> {
    identity: &'a str,
    secret: &'a str,
    create: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AuthReply {
    Session(Session),
    Rejected { error: String },
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    token: &'a str,
    entity_id: EntityId,
    payload: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcFailure {
    error: String,
}

#[derive(Deserialize)]
struct Notification {
    subject: String,
    #[serde(default)]
    content: serde_json::Value,
}

/// Interpret a procedure reply: `{"error": ...}` is a failure, anything
/// else is the result.
fn parse_reply(procedure: &str, raw: &[u8]) -> Result<serde_json::Value, TransportError> {
    let value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| TransportError::remote_call(procedure, e))?;
    serde_json::from_value::<RpcFailure>(value.clone()).map_or(Ok(value), |failure| {
        Err(TransportError::remote_call(procedure, failure.error))
    })
}

// -----------------------------------------------------------------------
// Transport
// -----------------------------------------------------------------------

/// A [`Transport`] over one shared NATS connection.
pub struct NatsTransport {
    client: async_nats::Client,
    subjects: Subjects,
}

impl std::fmt::Debug for NatsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsTransport")
            .field("subjects", &self.subjects)
            .finish_non_exhaustive()
    }
}

impl NatsTransport {
    /// Connect to the NATS server named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the connection cannot be
    /// established.
    pub async fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        let url = config.nats_url.as_str();
        info!(url, prefix = %config.subject_prefix, "connecting to NATS server");
        let client = async_nats::ConnectOptions::new()
            .name("geoswarm-runner")
            .connection_timeout(config.connect_timeout())
            .connect(url)
            .await
            .map_err(|e| TransportError::Connect(format!("failed to connect to {url}: {e}")))?;
        info!("NATS connection established");
        Ok(Self {
            client,
            subjects: Subjects::new(config.subject_prefix.clone()),
        })
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn authenticate(
        &self,
        credentials: &Credentials,
        create_if_missing: bool,
    ) -> Result<Session, TransportError> {
        let body = serde_json::to_vec(&AuthRequest {
            identity: &credentials.identity,
            secret: &credentials.secret,
            create: create_if_missing,
        })
        .map_err(|e| TransportError::Auth(format!("failed to encode request: {e}")))?;
        let reply = self
            .client
            .request(self.subjects.auth(), body.into())
            .await
            .map_err(|e| TransportError::Auth(format!("auth request failed: {e}")))?;
        match serde_json::from_slice(&reply.payload) {
            Ok(AuthReply::Session(session)) => Ok(session),
            Ok(AuthReply::Rejected { error }) => Err(TransportError::Auth(error)),
            Err(e) => Err(TransportError::Auth(format!("unreadable auth reply: {e}"))),
        }
    }

    async fn connect(&self, session: &Session) -> Result<Box<dyn Socket>, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut socket = NatsSocket {
            client: self.client.clone(),
            subjects: self.subjects.clone(),
            session: session.clone(),
            tx,
            rx: Some(rx),
            cells: BTreeMap::new(),
            group: None,
            notify: None,
            closed: false,
        };

        let subject = self.subjects.notify(session.entity_id);
        let notifications = socket
            .subscribe(subject.clone())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        socket.notify = Some(forward(notifications, socket.tx.clone(), |_, payload| {
            match serde_json::from_slice::<Notification>(&payload) {
                Ok(n) => Some(InboundEvent::Notification {
                    subject: n.subject,
                    content: serde_json::to_vec(&n.content).unwrap_or_default(),
                }),
                Err(e) => {
                    warn!(error = %e, "dropping unreadable notification");
                    None
                }
            }
        }));
        if let Some(group) = session.group.as_ref().map(|g| g.name.clone()) {
            socket.follow_group(&group).await?;
        }
        debug!(entity = %session.entity_id, subject, "NATS socket open");
        Ok(Box::new(socket))
    }
}

/// Pump a subscription into an event channel until either side closes.
fn forward<F>(
    mut subscriber: async_nats::Subscriber,
    tx: mpsc::Sender<InboundEvent>,
    map: F,
) -> JoinHandle<()>
where
    F: Fn(&str, Vec<u8>) -> Option<InboundEvent> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = subscriber.next().await {
            let Some(event) = map(message.subject.as_str(), message.payload.to_vec()) else {
                continue;
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    })
}

// -----------------------------------------------------------------------
// Socket
// -----------------------------------------------------------------------

/// One entity's logical session on a [`NatsTransport`].
pub struct NatsSocket {
    client: async_nats::Client,
    subjects: Subjects,
    session: Session,
    tx: mpsc::Sender<InboundEvent>,
    rx: Option<mpsc::Receiver<InboundEvent>>,
    cells: BTreeMap<Cell, JoinHandle<()>>,
    group: Option<(String, JoinHandle<()>)>,
    notify: Option<JoinHandle<()>>,
    closed: bool,
}

impl std::fmt::Debug for NatsSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsSocket")
            .field("entity", &self.session.entity_id)
            .field("cells", &self.cells.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl NatsSocket {
    async fn subscribe(&self, subject: String) -> Result<async_nats::Subscriber, TransportError> {
        self.client.subscribe(subject.clone()).await.map_err(|e| {
            TransportError::remote_call("subscribe", format!("failed to subscribe to {subject}: {e}"))
        })
    }

    async fn publish(&self, subject: String, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| {
                TransportError::remote_call("publish", format!("failed to publish to {subject}: {e}"))
            })
    }

    async fn announce(&self, cell: Cell, presence: &PresenceEvent) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(presence)
            .map_err(|e| TransportError::remote_call("presence", e))?;
        self.publish(self.subjects.cell_presence(cell), payload).await
    }

    async fn join(&mut self, cell: Cell) -> Result<(), TransportError> {
        if self.cells.contains_key(&cell) {
            return Ok(());
        }
        let subscriber = self.subscribe(self.subjects.cell_wildcard(cell)).await?;
        let task = forward(subscriber, self.tx.clone(), move |subject, payload| {
            cell_event(cell, subject, payload)
        });
        self.cells.insert(cell, task);
        let presence = PresenceEvent {
            joins: vec![self.session.entity_id],
            leaves: Vec::new(),
        };
        self.announce(cell, &presence).await
    }

    async fn leave(&mut self, cell: Cell) -> Result<(), TransportError> {
        let Some(task) = self.cells.remove(&cell) else {
            return Ok(());
        };
        task.abort();
        let presence = PresenceEvent {
            joins: Vec::new(),
            leaves: vec![self.session.entity_id],
        };
        self.announce(cell, &presence).await
    }

    async fn follow_group(&mut self, name: &str) -> Result<(), TransportError> {
        if self.group.as_ref().is_some_and(|(current, _)| current == name) {
            return Ok(());
        }
        if let Some((_, task)) = self.group.take() {
            task.abort();
        }
        let subscriber = self.subscribe(self.subjects.group(name)).await?;
        let stream = name.to_owned();
        let task = forward(subscriber, self.tx.clone(), move |_, payload| {
            Some(InboundEvent::StreamData {
                stream: StreamRef::Group(stream.clone()),
                payload,
            })
        });
        self.group = Some((name.to_owned(), task));
        Ok(())
    }

    async fn send_location(&mut self, broadcast: LocationBroadcast) -> Result<(), TransportError> {
        let cell: Cell = broadcast
            .key
            .parse()
            .map_err(|e| TransportError::remote_call(PROC_SEND_LOCATION, e))?;
        let payload = serde_json::to_vec(&StreamMessage {
            user_id: self.session.entity_id,
            data: broadcast.data,
            group: broadcast.group.clone(),
        })
        .map_err(|e| TransportError::remote_call(PROC_SEND_LOCATION, e))?;

        self.publish(self.subjects.cell_data(cell), payload.clone()).await?;
        if let Some(group) = broadcast.group {
            self.follow_group(&group).await?;
            self.publish(self.subjects.group(&group), payload).await?;
        }
        Ok(())
    }

    async fn request(
        &self,
        procedure: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let body = serde_json::to_vec(&RpcRequest {
            token: &self.session.token,
            entity_id: self.session.entity_id,
            payload,
        })
        .map_err(|e| TransportError::remote_call(procedure, e))?;
        let reply = self
            .client
            .request(self.subjects.rpc(procedure), body.into())
            .await
            .map_err(|e| TransportError::remote_call(procedure, e))?;
        parse_reply(procedure, &reply.payload)
    }

    fn abort_tasks(&mut self) {
        for (_, task) in std::mem::take(&mut self.cells) {
            task.abort();
        }
        if let Some((_, task)) = self.group.take() {
            task.abort();
        }
        if let Some(task) = self.notify.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Socket for NatsSocket {
    async fn remote_call(
        &mut self,
        procedure: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match procedure {
            PROC_JOIN_CELL | PROC_LEAVE_CELL => {
                let request: CellRequest = decode_result(procedure, payload)?;
                let cell: Cell = request
                    .key
                    .parse()
                    .map_err(|e| TransportError::remote_call(procedure, e))?;
                if procedure == PROC_JOIN_CELL {
                    self.join(cell).await?;
                } else {
                    self.leave(cell).await?;
                }
                Ok(serde_json::json!({}))
            }
            PROC_SEND_LOCATION => {
                let broadcast: LocationBroadcast = decode_result(procedure, payload)?;
                self.send_location(broadcast).await?;
                Ok(serde_json::json!({}))
            }
            other => self.request(other, payload).await,
        }
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.rx.take()
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let cells: Vec<Cell> = self.cells.keys().copied().collect();
        for cell in cells {
            if let Err(e) = self.leave(cell).await {
                debug!(entity = %self.session.entity_id, %cell, error = %e, "leave on close failed");
            }
        }
        self.abort_tasks();
    }
}

impl Drop for NatsSocket {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
