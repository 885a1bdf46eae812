//! In-process stand-in for the realtime backend.
//!
//! [`LoopbackTransport`] behaves like a small game server living in the
//! same process: it keeps accounts, places each new account in an
//! `AutoGroup_N` group of at most [`MAX_GROUP_SIZE`] members, and fans
//! position and presence events out to every socket joined to a cell.
//! It backs the `loopback` transport kind and the integration tests.
//!
//! Faults can be injected with [`LoopbackFaults`]: rejected identities,
//! refused connects, every-Nth remote-call failure and per-call latency.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use geoswarm_types::{
    Cell, CellRequest, EntityId, GroupId, GroupInfo, LocationBroadcast, PROC_GET_BUILDINGS,
    PROC_JOIN_CELL, PROC_LEAVE_CELL, PROC_SEND_LOCATION, PointOfInterest, PresenceEvent,
    StreamMessage,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::event::decode_result;
use crate::transport::{
    Credentials, EVENT_CHANNEL_CAPACITY, InboundEvent, Session, Socket, StreamRef, Transport,
};

/// Maximum members of an automatically created group.
pub const MAX_GROUP_SIZE: usize = 5;

/// Prefix of automatically created group names.
pub const GROUP_NAME_PREFIX: &str = "AutoGroup";

/// Faults to inject into a [`LoopbackTransport`].
#[derive(Debug, Clone, Default)]
pub struct LoopbackFaults {
    /// Identities whose authentication always fails.
    pub rejected_identities: HashSet<String>,
    /// Identities whose socket connect always fails.
    pub refused_connects: HashSet<String>,
    /// Identities whose socket the server drops after its first call.
    pub dropped_sockets: HashSet<String>,
    /// Fail every Nth remote call across all sockets. 0 disables.
    pub fail_every_nth_call: u64,
    /// Delay applied to every remote call.
    pub latency: Duration,
}

#[derive(Debug)]
struct Account {
    secret: String,
    entity_id: EntityId,
    group: GroupInfo,
}

#[derive(Debug)]
struct Connection {
    events: mpsc::Sender<InboundEvent>,
    group: String,
}

#[derive(Debug, Default)]
struct Hub {
    accounts: HashMap<String, Account>,
    groups: Vec<(GroupInfo, usize)>,
    connections: HashMap<EntityId, Connection>,
    cells: BTreeMap<Cell, BTreeSet<EntityId>>,
    buildings: Vec<PointOfInterest>,
    calls: u64,
    dropped_events: u64,
}

impl Hub {
    fn assign_group(&mut self) -> GroupInfo {
        if let Some((group, members)) = self.groups.last_mut() {
            if *members < MAX_GROUP_SIZE {
                *members = members.saturating_add(1);
                return group.clone();
            }
        }
        let group = GroupInfo {
            id: GroupId::new(),
            name: format!("{GROUP_NAME_PREFIX}_{}", self.groups.len().saturating_add(1)),
        };
        self.groups.push((group.clone(), 1));
        group
    }

    fn deliver(&mut self, to: EntityId, event: InboundEvent) {
        let Some(connection) = self.connections.get(&to) else {
            return;
        };
        if connection.events.try_send(event).is_err() {
            self.dropped_events = self.dropped_events.saturating_add(1);
            trace!(entity = %to, "loopback event dropped");
        }
    }

    fn fan_out_cell(&mut self, cell: Cell, except: Option<EntityId>, event: &InboundEvent) {
        let members: Vec<EntityId> = self
            .cells
            .get(&cell)
            .map(|m| m.iter().copied().filter(|id| Some(*id) != except).collect())
            .unwrap_or_default();
        for member in members {
            self.deliver(member, event.clone());
        }
    }

    fn fan_out_group(&mut self, group: &str, event: &InboundEvent) {
        let members: Vec<EntityId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.group == group)
            .map(|(id, _)| *id)
            .collect();
        for member in members {
            self.deliver(member, event.clone());
        }
    }

    fn leave_cell(&mut self, entity: EntityId, cell: Cell) -> bool {
        let Some(members) = self.cells.get_mut(&cell) else {
            return false;
        };
        let removed = members.remove(&entity);
        if members.is_empty() {
            self.cells.remove(&cell);
        }
        if removed {
            let event = presence(StreamRef::Cell(cell), Vec::new(), vec![entity]);
            self.fan_out_cell(cell, Some(entity), &event);
        }
        removed
    }
}

fn presence(stream: StreamRef, joins: Vec<EntityId>, leaves: Vec<EntityId>) -> InboundEvent {
    InboundEvent::Presence {
        stream,
        payload: to_payload(&PresenceEvent { joins, leaves }),
    }
}

fn to_payload<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// An in-process realtime backend.
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    hub: Arc<Mutex<Hub>>,
    faults: Arc<LoopbackFaults>,
}

impl LoopbackTransport {
    /// Create a backend with no accounts and no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that injects `faults`.
    pub fn with_faults(faults: LoopbackFaults) -> Self {
        Self {
            hub: Arc::default(),
            faults: Arc::new(faults),
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the points of interest returned by `get_buildings`.
    pub fn set_buildings(&self, buildings: Vec<PointOfInterest>) {
        self.hub().buildings = buildings;
    }

    /// Send a notification to a connected entity.
    ///
    /// Returns `false` if the entity has no open socket.
    pub fn notify(&self, entity: EntityId, subject: &str, content: &serde_json::Value) -> bool {
        self.inject(
            entity,
            InboundEvent::Notification {
                subject: subject.to_owned(),
                content: to_payload(content),
            },
        )
    }

    /// Push an arbitrary event to a connected entity.
    ///
    /// Returns `false` if the entity has no open socket.
    pub fn inject(&self, entity: EntityId, event: InboundEvent) -> bool {
        let mut hub = self.hub();
        if !hub.connections.contains_key(&entity) {
            return false;
        }
        hub.deliver(entity, event);
        true
    }

    /// Number of cells `entity` is joined to.
    pub fn memberships(&self, entity: EntityId) -> usize {
        self.hub()
            .cells
            .values()
            .filter(|members| members.contains(&entity))
            .count()
    }

    /// Total cell memberships across all entities.
    pub fn total_memberships(&self) -> usize {
        self.hub().cells.values().map(BTreeSet::len).sum()
    }

    /// Entities joined to `cell`.
    pub fn cell_members(&self, cell: Cell) -> Vec<EntityId> {
        self.hub()
            .cells
            .get(&cell)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of open sockets.
    pub fn open_sockets(&self) -> usize {
        self.hub().connections.len()
    }

    /// Number of accounts created so far.
    pub fn account_count(&self) -> usize {
        self.hub().accounts.len()
    }

    /// The group assigned to `identity`, if it has an account.
    pub fn group_of(&self, identity: &str) -> Option<GroupInfo> {
        self.hub().accounts.get(identity).map(|a| a.group.clone())
    }

    /// The entity behind `identity`, if it has an account.
    pub fn entity_of(&self, identity: &str) -> Option<EntityId> {
        self.hub().accounts.get(identity).map(|a| a.entity_id)
    }

    /// Events dropped because a socket's channel was full.
    pub fn dropped_events(&self) -> u64 {
        self.hub().dropped_events
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn authenticate(
        &self,
        credentials: &Credentials,
        create_if_missing: bool,
    ) -> Result<Session, TransportError> {
        if self.faults.rejected_identities.contains(&credentials.identity) {
            return Err(TransportError::Auth(format!(
                "identity {} rejected",
                credentials.identity
            )));
        }

        let mut hub = self.hub();
        if let Some(account) = hub.accounts.get(&credentials.identity) {
            if account.secret != credentials.secret {
                return Err(TransportError::Auth("invalid credentials".to_owned()));
            }
            return Ok(Session {
                entity_id: account.entity_id,
                token: uuid::Uuid::new_v4().to_string(),
                identity: credentials.identity.clone(),
                group: Some(account.group.clone()),
            });
        }
        if !create_if_missing {
            return Err(TransportError::Auth(format!(
                "no account for {}",
                credentials.identity
            )));
        }

        let group = hub.assign_group();
        let entity_id = EntityId::new();
        debug!(identity = %credentials.identity, entity = %entity_id, group = %group.name, "loopback account created");
        hub.accounts.insert(
            credentials.identity.clone(),
            Account {
                secret: credentials.secret.clone(),
                entity_id,
                group: group.clone(),
            },
        );
        Ok(Session {
            entity_id,
            token: uuid::Uuid::new_v4().to_string(),
            identity: credentials.identity.clone(),
            group: Some(group),
        })
    }

    async fn connect(&self, session: &Session) -> Result<Box<dyn Socket>, TransportError> {
        if self.faults.refused_connects.contains(&session.identity) {
            return Err(TransportError::Connect(format!(
                "connection refused for {}",
                session.identity
            )));
        }
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let group = session.group.as_ref().map(|g| g.name.clone()).unwrap_or_default();
        self.hub()
            .connections
            .insert(session.entity_id, Connection { events: tx, group });
        Ok(Box::new(LoopbackSocket {
            transport: self.clone(),
            entity_id: session.entity_id,
            events: Some(rx),
            joined: BTreeSet::new(),
            calls: 0,
            dropped: self.faults.dropped_sockets.contains(&session.identity),
            closed: false,
        }))
    }
}

/// A socket on a [`LoopbackTransport`].
#[derive(Debug)]
pub struct LoopbackSocket {
    transport: LoopbackTransport,
    entity_id: EntityId,
    events: Option<mpsc::Receiver<InboundEvent>>,
    joined: BTreeSet<Cell>,
    calls: u64,
    dropped: bool,
    closed: bool,
}

impl LoopbackSocket {
    fn join(&mut self, cell: Cell) {
        let mut hub = self.transport.hub();
        let inserted = hub.cells.entry(cell).or_default().insert(self.entity_id);
        if inserted {
            let event = presence(StreamRef::Cell(cell), vec![self.entity_id], Vec::new());
            hub.fan_out_cell(cell, Some(self.entity_id), &event);
        }
        self.joined.insert(cell);
    }

    fn leave(&mut self, cell: Cell) {
        self.transport.hub().leave_cell(self.entity_id, cell);
        self.joined.remove(&cell);
    }

    fn send_location(&self, broadcast: LocationBroadcast) -> Result<(), TransportError> {
        let cell: Cell = broadcast
            .key
            .parse()
            .map_err(|e| TransportError::remote_call(PROC_SEND_LOCATION, e))?;
        let message = StreamMessage {
            user_id: self.entity_id,
            data: broadcast.data,
            group: broadcast.group.clone(),
        };
        let payload = to_payload(&message);

        let mut hub = self.transport.hub();
        let cell_event = InboundEvent::StreamData {
            stream: StreamRef::Cell(cell),
            payload: payload.clone(),
        };
        hub.fan_out_cell(cell, None, &cell_event);
        if let Some(group) = broadcast.group {
            let group_event = InboundEvent::StreamData {
                stream: StreamRef::Group(group.clone()),
                payload,
            };
            hub.fan_out_group(&group, &group_event);
        }
        Ok(())
    }

    fn should_fail(&self) -> bool {
        let nth = self.transport.faults.fail_every_nth_call;
        let mut hub = self.transport.hub();
        hub.calls = hub.calls.saturating_add(1);
        nth > 0 && hub.calls.checked_rem(nth) == Some(0)
    }
}

#[async_trait]
impl Socket for LoopbackSocket {
    async fn remote_call(
        &mut self,
        procedure: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        if self.closed || (self.dropped && self.calls > 0) {
            return Err(TransportError::Closed);
        }
        self.calls = self.calls.saturating_add(1);
        let latency = self.transport.faults.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.should_fail() {
            return Err(TransportError::remote_call(procedure, "injected failure"));
        }

        match procedure {
            PROC_JOIN_CELL | PROC_LEAVE_CELL => {
                let request: CellRequest = decode_result(procedure, payload)?;
                let cell: Cell = request
                    .key
                    .parse()
                    .map_err(|e| TransportError::remote_call(procedure, e))?;
                if procedure == PROC_JOIN_CELL {
                    self.join(cell);
                } else {
                    self.leave(cell);
                }
                Ok(serde_json::json!({}))
            }
            PROC_SEND_LOCATION => {
                let broadcast: LocationBroadcast = decode_result(procedure, payload)?;
                self.send_location(broadcast)?;
                Ok(serde_json::json!({}))
            }
            PROC_GET_BUILDINGS => {
                let buildings = self.transport.hub().buildings.clone();
                serde_json::to_value(buildings).map_err(|e| TransportError::remote_call(procedure, e))
            }
            other => Err(TransportError::remote_call(other, "unknown procedure")),
        }
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.events.take()
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut hub = self.transport.hub();
        for cell in std::mem::take(&mut self.joined) {
            hub.leave_cell(self.entity_id, cell);
        }
        hub.connections.remove(&self.entity_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use geoswarm_types::Coordinate;

    use super::*;

    fn creds(identity: &str) -> Credentials {
        Credentials {
            identity: identity.to_owned(),
            secret: "secret".to_owned(),
        }
    }

    fn join_payload(cell: Cell) -> serde_json::Value {
        serde_json::to_value(CellRequest::new(cell, Coordinate::default())).unwrap()
    }

    #[tokio::test]
    async fn accounts_are_grouped_in_fives() {
        let transport = LoopbackTransport::new();
        for i in 0..11 {
            transport.authenticate(&creds(&format!("bot{i}")), true).await.unwrap();
        }
        assert_eq!(transport.group_of("bot0").unwrap().name, "AutoGroup_1");
        assert_eq!(transport.group_of("bot4").unwrap().name, "AutoGroup_1");
        assert_eq!(transport.group_of("bot5").unwrap().name, "AutoGroup_2");
        assert_eq!(transport.group_of("bot10").unwrap().name, "AutoGroup_3");
    }

    #[tokio::test]
    async fn unknown_identity_without_create_is_rejected() {
        let transport = LoopbackTransport::new();
        let err = transport.authenticate(&creds("nobody"), false).await.unwrap_err();
        assert!(matches!(err, TransportError::Auth(_)));

        transport.authenticate(&creds("somebody"), true).await.unwrap();
        let wrong = Credentials {
            identity: "somebody".into(),
            secret: "nope".into(),
        };
        assert!(transport.authenticate(&wrong, false).await.is_err());
        let again = transport.authenticate(&creds("somebody"), false).await.unwrap();
        assert_eq!(transport.account_count(), 1);
        assert!(again.group.is_some());
    }

    #[tokio::test]
    async fn join_fans_presence_and_close_leaves_everything() {
        let transport = LoopbackTransport::new();
        let a = transport.authenticate(&creds("a"), true).await.unwrap();
        let b = transport.authenticate(&creds("b"), true).await.unwrap();
        let mut sock_a = transport.connect(&a).await.unwrap();
        let mut sock_b = transport.connect(&b).await.unwrap();
        let mut events_a = sock_a.take_events().unwrap();
        assert!(sock_a.take_events().is_none());

        let cell = Cell::new(1, 1);
        sock_a.remote_call(PROC_JOIN_CELL, join_payload(cell)).await.unwrap();
        sock_b.remote_call(PROC_JOIN_CELL, join_payload(cell)).await.unwrap();
        assert_eq!(transport.cell_members(cell).len(), 2);

        let event = events_a.recv().await.unwrap();
        assert_eq!(event.kind(), "presence");
        if let InboundEvent::Presence { stream, payload } = event {
            assert_eq!(stream, StreamRef::Cell(cell));
            let event: PresenceEvent = serde_json::from_slice(&payload).unwrap();
            assert_eq!(event.joins, vec![b.entity_id]);
        }

        sock_b.close().await;
        assert_eq!(transport.memberships(b.entity_id), 0);
        assert_eq!(transport.open_sockets(), 1);
        let err = sock_b.remote_call(PROC_LEAVE_CELL, join_payload(cell)).await.unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }

    #[tokio::test]
    async fn every_nth_call_fails() {
        let transport = LoopbackTransport::with_faults(LoopbackFaults {
            fail_every_nth_call: 3,
            ..LoopbackFaults::default()
        });
        let session = transport.authenticate(&creds("a"), true).await.unwrap();
        let mut socket = transport.connect(&session).await.unwrap();
        let mut failures = 0u32;
        for lon in 0..9 {
            if socket
                .remote_call(PROC_JOIN_CELL, join_payload(Cell::new(0, lon)))
                .await
                .is_err()
            {
                failures = failures.saturating_add(1);
            }
        }
        assert_eq!(failures, 3);
        assert_eq!(transport.memberships(session.entity_id), 6);
    }

    #[tokio::test]
    async fn refused_connect_is_a_connect_error() {
        let transport = LoopbackTransport::with_faults(LoopbackFaults {
            refused_connects: HashSet::from(["a".to_owned()]),
            ..LoopbackFaults::default()
        });
        let session = transport.authenticate(&creds("a"), true).await.unwrap();
        let err = transport.connect(&session).await.err().unwrap();
        assert!(matches!(err, TransportError::Connect(_)));
    }
}
