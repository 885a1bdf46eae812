//! Entity Driver: one entity's connection, movement and interest lifecycle.
//!
//! ```text
//! Disconnected --spawn--> Connecting --joined--> Active --shutdown/fatal--> Draining --> Disconnected
//!                              |                                                             ^
//!                              +------------------ auth/connect failure ---------------------+
//! ```
//!
//! A driver runs as one task and owns everything it touches: its socket,
//! its [`InterestSet`], its [`PresenceMirror`] and its points-of-interest
//! cache. The tick handler runs inside the driver's `select!` loop, so two
//! ticks never overlap and a tick that overruns its period skips the
//! missed ticks instead of queueing them.
//!
//! Remote-call failures inside a tick are logged, counted and absorbed.
//! The reconciler has already committed the intended interest set, so a
//! missed leave is retried by nobody (the cell is no longer wanted) and a
//! missed join is [`forgotten`](InterestSet::forget) and planned again on
//! the next tick.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use geoswarm_interest::{
    Grid, InterestError, InterestPolicy, InterestSet, MirrorConfig, PresenceMirror,
    ReconcileStrategy,
};
use geoswarm_types::{
    BuildingNotice, Cell, CellRequest, Classification, Coordinate, EntityId, GroupId, GroupMove,
    LocationBroadcast, PROC_GET_BUILDINGS, PROC_JOIN_CELL, PROC_LEAVE_CELL, PROC_SEND_LOCATION,
    PointOfInterest, PresenceEvent, SUBJECT_BUILDING_DELETE, SUBJECT_BUILDING_UPDATE,
    SUBJECT_BUILDINGS_UPDATE, SUBJECT_GROUP_MOVE, StreamMessage,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::SwarmConfig;
use crate::error::TransportError;
use crate::event::{decode, decode_result};
use crate::movement::MovementSource;
use crate::status::{DriverPhase, SwarmStatus};
use crate::transport::{Credentials, InboundEvent, Session, Socket, StreamRef, Transport};

/// Floor for tick and eviction periods; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

// -----------------------------------------------------------------------
// Settings and reports
// -----------------------------------------------------------------------

/// Per-driver settings shared by every driver in a swarm.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// The grid all entities index against.
    pub grid: Grid,
    /// Which cells an entity subscribes to.
    pub policy: InterestPolicy,
    /// How joins and leaves are planned.
    pub strategy: ReconcileStrategy,
    /// Presence mirror limits, or `None` to run without a mirror.
    pub mirror: Option<MirrorConfig>,
    /// Stale-presence eviction cadence.
    pub eviction_interval: Duration,
    /// Movement tick period.
    pub tick_interval: Duration,
    /// Bound on authenticate and on connect, each.
    pub connect_timeout: Duration,
    /// Bound on each remote call.
    pub call_timeout: Duration,
    /// Whether authentication may create missing accounts.
    pub create_if_missing: bool,
}

impl DriverSettings {
    /// Derive driver settings from the runner configuration.
    ///
    /// # Errors
    ///
    /// Returns [`InterestError::InvalidCellSize`] for an unusable cell size.
    pub fn from_config(config: &SwarmConfig) -> Result<Self, InterestError> {
        Ok(Self {
            grid: Grid::new(config.grid.cell_size)?,
            policy: config.grid.policy,
            strategy: config.grid.reconcile,
            mirror: config
                .presence
                .enabled
                .then(|| config.presence.mirror_config()),
            eviction_interval: config.presence.eviction_interval(),
            tick_interval: config.movement.tick_interval(),
            connect_timeout: config.transport.connect_timeout(),
            call_timeout: config.transport.call_timeout(),
            create_if_missing: config.swarm.create_if_missing,
        })
    }
}

/// Why an active driver started draining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainReason {
    /// The swarm is shutting down.
    Shutdown,
    /// A transport error ended the session.
    Fatal(TransportError),
    /// The socket's event stream ended.
    EventsClosed,
}

/// How a driver's run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOutcome {
    /// Authentication failed; the driver never connected.
    AuthFailed(TransportError),
    /// The socket could not be opened.
    ConnectFailed(TransportError),
    /// The socket opened but joining the first cells hit a fatal error.
    /// Whatever was joined is left again; the driver never became active.
    StartFailed(TransportError),
    /// The driver was active, then drained.
    Drained(DrainReason),
}

/// Final account of one driver's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverReport {
    /// Entity index within the swarm.
    pub index: u32,
    /// The entity id, once authenticated.
    pub entity: Option<EntityId>,
    /// How the run ended.
    pub outcome: DriverOutcome,
    /// Cells still in the interest set after draining. Always 0 on a
    /// completed drain.
    pub cells_remaining: usize,
    /// Leave calls that failed while draining.
    pub failed_leaves: u64,
    /// Movement ticks completed.
    pub ticks: u64,
    /// Remote-call failures absorbed.
    pub remote_call_failures: u64,
    /// Malformed events dropped.
    pub malformed_events: u64,
    /// Remote entities in the presence mirror when the drain started.
    pub mirrored: usize,
    /// Points of interest cached at the end of the run.
    pub points_of_interest: usize,
}

impl DriverReport {
    /// Whether the driver ever became active.
    pub const fn reached_active(&self) -> bool {
        matches!(self.outcome, DriverOutcome::Drained(_))
    }

    const fn failed(index: u32, entity: Option<EntityId>, outcome: DriverOutcome) -> Self {
        Self {
            index,
            entity,
            outcome,
            cells_remaining: 0,
            failed_leaves: 0,
            ticks: 0,
            remote_call_failures: 0,
            malformed_events: 0,
            mirrored: 0,
            points_of_interest: 0,
        }
    }
}

// -----------------------------------------------------------------------
// Driver
// -----------------------------------------------------------------------

/// Drives one entity from spawn to disconnect.
pub struct EntityDriver {
    index: u32,
    credentials: Credentials,
    settings: Arc<DriverSettings>,
    transport: Arc<dyn Transport>,
    movement: Box<dyn MovementSource>,
    status: Arc<SwarmStatus>,
}

impl std::fmt::Debug for EntityDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDriver")
            .field("index", &self.index)
            .field("identity", &self.credentials.identity)
            .finish_non_exhaustive()
    }
}

impl EntityDriver {
    /// Create a driver for entity `index`.
    pub const fn new(
        index: u32,
        credentials: Credentials,
        settings: Arc<DriverSettings>,
        transport: Arc<dyn Transport>,
        movement: Box<dyn MovementSource>,
        status: Arc<SwarmStatus>,
    ) -> Self {
        Self {
            index,
            credentials,
            settings,
            transport,
            movement,
            status,
        }
    }

    /// Run the entity until shutdown or a fatal error.
    ///
    /// `ready` receives `true` once the entity is active and `false` if it
    /// failed to connect. Setting `shutdown` to `true` starts the drain;
    /// an in-flight tick completes first.
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        ready: oneshot::Sender<bool>,
    ) -> DriverReport {
        let index = self.index;
        let status = Arc::clone(&self.status);
        status.transition(DriverPhase::Disconnected, DriverPhase::Connecting);
        debug!(index, identity = %self.credentials.identity, "entity connecting");

        let (session, socket) = match self.open().await {
            Ok(opened) => opened,
            Err((entity, outcome)) => {
                warn!(index, identity = %self.credentials.identity, outcome = ?outcome, "entity failed to connect");
                status.transition(DriverPhase::Connecting, DriverPhase::Disconnected);
                status.record_failed();
                ready.send(false).ok();
                return DriverReport::failed(index, entity, outcome);
            }
        };

        let mut entity =
            ActiveEntity::new(index, &session, socket, self.settings, self.movement, status);
        let (_idle_tx, idle_rx) = mpsc::channel(1);
        let mut events = entity.socket.take_events().unwrap_or(idle_rx);

        if let Err(e) = entity.start().await {
            warn!(index, entity = %entity.entity_id, error = %e, "entity failed to join its first cells");
            entity.status.record_failed();
            ready.send(false).ok();
            return entity
                .drain(DriverPhase::Connecting, DriverOutcome::StartFailed(e))
                .await;
        }
        entity
            .status
            .transition(DriverPhase::Connecting, DriverPhase::Active);
        ready.send(true).ok();
        info!(
            index,
            entity = %entity.entity_id,
            cell = %entity.cell,
            cells = entity.interest.len(),
            group = entity.group_name.as_deref().unwrap_or("-"),
            "entity active"
        );

        let stopping = *shutdown.borrow_and_update();
        let reason = if stopping {
            DrainReason::Shutdown
        } else {
            entity.run_active(&mut shutdown, &mut events).await
        };
        entity
            .drain(DriverPhase::Active, DriverOutcome::Drained(reason))
            .await
    }

    async fn open(
        &self,
    ) -> Result<(Session, Box<dyn Socket>), (Option<EntityId>, DriverOutcome)> {
        let limit = self.settings.connect_timeout;
        let session = match time::timeout(
            limit,
            self.transport
                .authenticate(&self.credentials, self.settings.create_if_missing),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err((None, DriverOutcome::AuthFailed(e))),
            Err(_elapsed) => {
                return Err((None, DriverOutcome::AuthFailed(timeout("authenticate", limit))));
            }
        };

        match time::timeout(limit, self.transport.connect(&session)).await {
            Ok(Ok(socket)) => Ok((session, socket)),
            Ok(Err(e)) => Err((Some(session.entity_id), DriverOutcome::ConnectFailed(e))),
            Err(_elapsed) => Err((
                Some(session.entity_id),
                DriverOutcome::ConnectFailed(timeout("connect", limit)),
            )),
        }
    }
}

fn timeout(procedure: &str, limit: Duration) -> TransportError {
    TransportError::Timeout {
        procedure: procedure.to_owned(),
        after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
    }
}

fn now() -> std::time::Instant {
    time::Instant::now().into_std()
}

// -----------------------------------------------------------------------
// Connected state
// -----------------------------------------------------------------------

/// Everything a connected driver owns.
struct ActiveEntity {
    index: u32,
    entity_id: EntityId,
    group_id: Option<GroupId>,
    group_name: Option<String>,
    socket: Box<dyn Socket>,
    settings: Arc<DriverSettings>,
    movement: Box<dyn MovementSource>,
    status: Arc<SwarmStatus>,
    coordinate: Coordinate,
    cell: Cell,
    interest: InterestSet,
    mirror: Option<PresenceMirror>,
    points: BTreeMap<i64, PointOfInterest>,
    ticks: u64,
    remote_call_failures: u64,
    malformed_events: u64,
}

impl ActiveEntity {
    fn new(
        index: u32,
        session: &Session,
        socket: Box<dyn Socket>,
        settings: Arc<DriverSettings>,
        mut movement: Box<dyn MovementSource>,
        status: Arc<SwarmStatus>,
    ) -> Self {
        let coordinate = movement.spawn_position();
        let cell = settings.grid.cell_of(coordinate);
        let mut mirror = settings.mirror.map(PresenceMirror::new);
        if let Some(mirror) = mirror.as_mut() {
            mirror.set_viewpoint(coordinate);
        }
        Self {
            index,
            entity_id: session.entity_id,
            group_id: session.group.as_ref().map(|g| g.id),
            group_name: session.group.as_ref().map(|g| g.name.clone()),
            socket,
            interest: InterestSet::new(settings.policy, settings.strategy),
            settings,
            movement,
            status,
            coordinate,
            cell,
            mirror,
            points: BTreeMap::new(),
            ticks: 0,
            remote_call_failures: 0,
            malformed_events: 0,
        }
    }

    /// Join the initial interest set (all joins against an empty set).
    async fn start(&mut self) -> Result<(), TransportError> {
        self.reconcile().await
    }

    async fn run_active(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        events: &mut mpsc::Receiver<InboundEvent>,
    ) -> DrainReason {
        let mut ticker = time::interval(self.settings.tick_interval.max(MIN_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.reset();
        let mut eviction = time::interval(self.settings.eviction_interval.max(MIN_PERIOD));
        eviction.set_missed_tick_behavior(MissedTickBehavior::Skip);
        eviction.reset();
        let evicting = self.mirror.is_some();

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break DrainReason::Shutdown;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        break DrainReason::Fatal(e);
                    }
                }
                _ = eviction.tick(), if evicting => self.evict_stale(),
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            break DrainReason::Fatal(e);
                        }
                    }
                    None => break DrainReason::EventsClosed,
                },
            }
        }
    }

    // -------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------

    async fn tick(&mut self) -> Result<(), TransportError> {
        self.coordinate = self.movement.next_position(self.coordinate);
        self.cell = self.settings.grid.cell_of(self.coordinate);
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.set_viewpoint(self.coordinate);
        }

        let reconciled = self.reconcile().await;
        // Position goes out every tick, whether or not the set changed.
        let broadcast = self.broadcast().await;

        self.ticks = self.ticks.saturating_add(1);
        self.status.record_tick();
        reconciled?;
        match broadcast {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.absorb(PROC_SEND_LOCATION, &e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Reconcile against the interest set required at the current
    /// position and issue every planned call, absorbing individual
    /// failures. A fatal error is returned after the whole plan ran.
    async fn reconcile(&mut self) -> Result<(), TransportError> {
        let required = self
            .settings
            .grid
            .needed_cells(self.coordinate, self.cell, self.settings.policy);
        let plan = self.interest.reconcile(self.cell, required);
        if plan.is_empty() {
            return Ok(());
        }
        trace!(
            entity = %self.entity_id,
            cell = %self.cell,
            joins = plan.to_join.len(),
            leaves = plan.to_leave.len(),
            "interest changed"
        );

        let mut fatal = None;
        for cell in plan.to_leave {
            if let Err(e) = self.cell_call(PROC_LEAVE_CELL, cell).await {
                self.absorb_or_keep(PROC_LEAVE_CELL, e, &mut fatal);
            }
            if let Some(mirror) = self.mirror.as_mut() {
                mirror.drop_cell(cell);
            }
        }
        for cell in plan.to_join {
            if let Err(e) = self.cell_call(PROC_JOIN_CELL, cell).await {
                self.interest.forget(cell);
                self.absorb_or_keep(PROC_JOIN_CELL, e, &mut fatal);
            }
        }
        fatal.map_or(Ok(()), Err)
    }

    async fn broadcast(&mut self) -> Result<(), TransportError> {
        let origin = self.settings.grid.origin(self.cell);
        let body = LocationBroadcast {
            lat: origin.lat,
            lon: origin.lon,
            key: self.cell.key(),
            data: self.coordinate,
            group: self.group_name.clone(),
        };
        let payload = serde_json::to_value(&body)
            .map_err(|e| TransportError::remote_call(PROC_SEND_LOCATION, e))?;
        self.call(PROC_SEND_LOCATION, payload).await.map(drop)
    }

    async fn cell_call(&mut self, procedure: &str, cell: Cell) -> Result<(), TransportError> {
        let request = CellRequest::new(cell, self.settings.grid.origin(cell));
        let payload =
            serde_json::to_value(&request).map_err(|e| TransportError::remote_call(procedure, e))?;
        self.call(procedure, payload).await.map(drop)
    }

    async fn call(
        &mut self,
        procedure: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let limit = self.settings.call_timeout;
        time::timeout(limit, self.socket.remote_call(procedure, payload))
            .await
            .unwrap_or_else(|_elapsed| Err(timeout(procedure, limit)))
    }

    fn absorb(&mut self, procedure: &str, error: &TransportError) {
        warn!(entity = %self.entity_id, procedure, error = %error, "remote call failed");
        self.remote_call_failures = self.remote_call_failures.saturating_add(1);
        self.status.record_remote_call_failure();
    }

    fn absorb_or_keep(
        &mut self,
        procedure: &str,
        error: TransportError,
        fatal: &mut Option<TransportError>,
    ) {
        self.absorb(procedure, &error);
        if error.is_fatal() && fatal.is_none() {
            *fatal = Some(error);
        }
    }

    fn evict_stale(&mut self) {
        if let Some(mirror) = self.mirror.as_mut() {
            let evicted = mirror.evict_stale(now());
            if evicted > 0 {
                trace!(entity = %self.entity_id, evicted, "stale presence evicted");
            }
        }
    }

    // -------------------------------------------------------------------
    // Inbound events
    // -------------------------------------------------------------------

    async fn handle_event(&mut self, event: InboundEvent) -> Result<(), TransportError> {
        let kind = event.kind();
        match event {
            InboundEvent::StreamData { stream, payload } => {
                match decode::<StreamMessage>(kind, &payload) {
                    Ok(message) if message.data.is_finite() => self.observe(&stream, &message),
                    Ok(_) => self.malformed(&TransportError::MalformedEvent {
                        kind,
                        message: "non-finite coordinate".to_owned(),
                    }),
                    Err(e) => self.malformed(&e),
                }
                Ok(())
            }
            InboundEvent::Presence { stream, payload } => {
                match decode::<PresenceEvent>(kind, &payload) {
                    Ok(presence) => self.apply_presence(&stream, &presence),
                    Err(e) => self.malformed(&e),
                }
                Ok(())
            }
            InboundEvent::Notification { subject, content } => {
                self.handle_notification(kind, &subject, &content).await
            }
        }
    }

    fn observe(&mut self, stream: &StreamRef, message: &StreamMessage) {
        if message.user_id == self.entity_id {
            return;
        }
        let cell = match stream {
            StreamRef::Cell(cell) => {
                // Late delivery on a cell we already left.
                if !self.interest.contains(cell) {
                    return;
                }
                *cell
            }
            StreamRef::Group(_) => self.settings.grid.cell_of(message.data),
        };
        let Some(mirror) = self.mirror.as_mut() else {
            return;
        };
        let classification =
            Classification::of(message.group.as_deref(), self.group_name.as_deref());
        let outcome = mirror.observe(message.user_id, cell, message.data, classification, now());
        trace!(entity = %self.entity_id, remote = %message.user_id, %cell, ?outcome, "presence observed");
    }

    fn apply_presence(&mut self, stream: &StreamRef, presence: &PresenceEvent) {
        let Some(mirror) = self.mirror.as_mut() else {
            return;
        };
        for remote in presence.leaves.iter().filter(|id| **id != self.entity_id) {
            let removed = mirror.remove_on_departure(*remote);
            trace!(entity = %self.entity_id, remote = %remote, ?stream, removed, "remote departed");
        }
    }

    async fn handle_notification(
        &mut self,
        kind: &'static str,
        subject: &str,
        content: &[u8],
    ) -> Result<(), TransportError> {
        match subject {
            SUBJECT_BUILDINGS_UPDATE => return self.resync_points().await,
            SUBJECT_BUILDING_UPDATE => match decode::<BuildingNotice>(kind, content) {
                Ok(notice) => {
                    self.points.insert(notice.data.id, notice.data);
                }
                Err(e) => self.malformed(&e),
            },
            SUBJECT_BUILDING_DELETE => match decode::<BuildingNotice>(kind, content) {
                Ok(notice) => {
                    self.points.remove(&notice.data.id);
                }
                Err(e) => self.malformed(&e),
            },
            SUBJECT_GROUP_MOVE => match decode::<GroupMove>(kind, content) {
                Ok(moved) => {
                    info!(
                        entity = %self.entity_id,
                        from = %moved.leave,
                        to = %moved.enter,
                        name = moved.enter_name.as_deref().unwrap_or("-"),
                        "entity moved to another group"
                    );
                    if self.group_id.is_some_and(|id| id != moved.leave) {
                        debug!(entity = %self.entity_id, "group move names a group we were not in");
                    }
                    self.group_id = Some(moved.enter);
                    self.group_name = moved.enter_name;
                }
                Err(e) => self.malformed(&e),
            },
            other => debug!(entity = %self.entity_id, subject = other, "ignoring notification"),
        }
        Ok(())
    }

    async fn resync_points(&mut self) -> Result<(), TransportError> {
        let result = self
            .call(PROC_GET_BUILDINGS, serde_json::json!({}))
            .await
            .and_then(|value| decode_result::<Vec<PointOfInterest>>(PROC_GET_BUILDINGS, value));
        match result {
            Ok(points) => {
                self.points = points.into_iter().map(|p| (p.id, p)).collect();
                debug!(entity = %self.entity_id, count = self.points.len(), "points of interest resynced");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.absorb(PROC_GET_BUILDINGS, &e);
                Ok(())
            }
        }
    }

    fn malformed(&mut self, error: &TransportError) {
        let kind = match error {
            TransportError::MalformedEvent { kind, .. } => *kind,
            _ => "unknown",
        };
        warn!(entity = %self.entity_id, kind, error = %error, "dropping malformed event");
        self.malformed_events = self.malformed_events.saturating_add(1);
        self.status.record_malformed_event();
    }

    // -------------------------------------------------------------------
    // Drain
    // -------------------------------------------------------------------

    /// Leave every held cell and close the socket. Only a driver drained
    /// from `Active` counts as finished.
    async fn drain(mut self, from: DriverPhase, outcome: DriverOutcome) -> DriverReport {
        self.status.transition(from, DriverPhase::Draining);
        debug!(entity = %self.entity_id, outcome = ?outcome, cells = self.interest.len(), "entity draining");

        let mut failed_leaves = 0u64;
        for cell in self.interest.drain() {
            if let Err(e) = self.cell_call(PROC_LEAVE_CELL, cell).await {
                failed_leaves = failed_leaves.saturating_add(1);
                self.absorb(PROC_LEAVE_CELL, &e);
            }
        }
        let mirrored = self.mirror.as_ref().map_or(0, PresenceMirror::len);
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.clear();
        }
        self.socket.close().await;

        self.status
            .transition(DriverPhase::Draining, DriverPhase::Disconnected);
        if from == DriverPhase::Active {
            self.status.record_finished();
        }
        debug!(entity = %self.entity_id, failed_leaves, ticks = self.ticks, "entity disconnected");

        DriverReport {
            index: self.index,
            entity: Some(self.entity_id),
            outcome,
            cells_remaining: self.interest.len(),
            failed_leaves,
            ticks: self.ticks,
            remote_call_failures: self.remote_call_failures,
            malformed_events: self.malformed_events,
            mirrored,
            points_of_interest: self.points.len(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use geoswarm_types::GroupInfo;

    use super::*;
    use crate::loopback::{LoopbackFaults, LoopbackTransport};
    use crate::movement::Stationary;

    const HERE: Coordinate = Coordinate::new(37.7749, -122.4194);

    fn settings(policy: InterestPolicy) -> Arc<DriverSettings> {
        let mut config = SwarmConfig::default();
        config.grid.policy = policy;
        Arc::new(DriverSettings::from_config(&config).unwrap())
    }

    fn driver(
        transport: &LoopbackTransport,
        identity: &str,
        settings: Arc<DriverSettings>,
        status: &Arc<SwarmStatus>,
    ) -> EntityDriver {
        EntityDriver::new(
            0,
            Credentials {
                identity: identity.to_owned(),
                secret: "secret".to_owned(),
            },
            settings,
            Arc::new(transport.clone()),
            Box::new(Stationary(HERE)),
            Arc::clone(status),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn active_entity_joins_then_drains_to_zero() {
        let transport = LoopbackTransport::new();
        let status = Arc::new(SwarmStatus::new());
        let (stop, shutdown) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(
            driver(&transport, "a", settings(InterestPolicy::FullNeighborhood), &status)
                .run(shutdown, ready_tx),
        );

        assert!(ready_rx.await.unwrap());
        assert_eq!(transport.total_memberships(), 9);
        assert_eq!(status.active(), 1);

        time::sleep(Duration::from_millis(3_500)).await;
        stop.send_replace(true);
        let report = task.await.unwrap();

        assert_eq!(report.outcome, DriverOutcome::Drained(DrainReason::Shutdown));
        assert_eq!(report.cells_remaining, 0);
        assert!(report.ticks >= 3);
        assert_eq!(transport.total_memberships(), 0);
        assert_eq!(transport.open_sockets(), 0);
        assert_eq!(status.snapshot().finished, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn neighbours_mirror_each_other() {
        let transport = LoopbackTransport::new();
        let status = Arc::new(SwarmStatus::new());
        let settings = settings(InterestPolicy::FullNeighborhood);
        let (stop, shutdown) = watch::channel(false);
        let mut tasks = Vec::new();
        for identity in ["a", "b"] {
            let (ready_tx, ready_rx) = oneshot::channel();
            let driver = driver(&transport, identity, Arc::clone(&settings), &status);
            tasks.push(tokio::spawn(driver.run(shutdown.clone(), ready_tx)));
            assert!(ready_rx.await.unwrap());
        }

        time::sleep(Duration::from_millis(3_500)).await;
        stop.send_replace(true);
        for task in tasks {
            let report = task.await.unwrap();
            assert_eq!(report.mirrored, 1);
            assert_eq!(report.malformed_events, 0);
        }
        assert_eq!(transport.total_memberships(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_identity_never_becomes_active() {
        let transport = LoopbackTransport::with_faults(LoopbackFaults {
            rejected_identities: ["bad".to_owned()].into_iter().collect(),
            ..LoopbackFaults::default()
        });
        let status = Arc::new(SwarmStatus::new());
        let (_stop, shutdown) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let report = driver(&transport, "bad", settings(InterestPolicy::DirectionalMinimal), &status)
            .run(shutdown, ready_tx)
            .await;

        assert!(!ready_rx.await.unwrap());
        assert!(matches!(report.outcome, DriverOutcome::AuthFailed(TransportError::Auth(_))));
        assert!(!report.reached_active());
        let snap = status.snapshot();
        assert_eq!((snap.failed, snap.connecting, snap.active), (1, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn socket_lost_during_first_joins_is_a_start_failure() {
        let transport = LoopbackTransport::with_faults(LoopbackFaults {
            dropped_sockets: ["flaky".to_owned()].into_iter().collect(),
            ..LoopbackFaults::default()
        });
        let status = Arc::new(SwarmStatus::new());
        let (_stop, shutdown) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let report = driver(&transport, "flaky", settings(InterestPolicy::FullNeighborhood), &status)
            .run(shutdown, ready_tx)
            .await;

        assert!(!ready_rx.await.unwrap());
        assert_eq!(report.outcome, DriverOutcome::StartFailed(TransportError::Closed));
        assert!(!report.reached_active());
        assert_eq!(report.ticks, 0);
        assert_eq!(report.cells_remaining, 0);
        // The one cell that was joined could not be left over the lost
        // socket; closing it still clears the membership.
        assert_eq!(report.failed_leaves, 1);
        assert_eq!(transport.total_memberships(), 0);
        assert_eq!(transport.open_sockets(), 0);
        let snap = status.snapshot();
        assert_eq!((snap.reached_active, snap.failed, snap.finished), (0, 1, 0));
        assert_eq!((snap.connecting, snap.active, snap.draining), (0, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_joins_are_retried_next_tick() {
        // Every third call fails: the initial joins lose some cells, and
        // later ticks put them back.
        let transport = LoopbackTransport::with_faults(LoopbackFaults {
            fail_every_nth_call: 3,
            ..LoopbackFaults::default()
        });
        let status = Arc::new(SwarmStatus::new());
        let (stop, shutdown) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(
            driver(&transport, "a", settings(InterestPolicy::FullNeighborhood), &status)
                .run(shutdown, ready_tx),
        );
        assert!(ready_rx.await.unwrap());
        assert!(transport.total_memberships() < 9);

        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.total_memberships(), 9);
        assert!(status.snapshot().remote_call_failures > 0);

        stop.send_replace(true);
        let report = task.await.unwrap();
        assert_eq!(report.cells_remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_update_points_and_group() {
        let transport = LoopbackTransport::new();
        transport.set_buildings(vec![PointOfInterest {
            id: 1,
            lat: HERE.lat,
            lon: HERE.lon,
            image: None,
            link: None,
            title: Some("Ferry Building".into()),
        }]);
        let status = Arc::new(SwarmStatus::new());
        let settings = settings(InterestPolicy::DirectionalMinimal);
        let home = settings.grid.cell_of(HERE);
        let (stop, shutdown) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(driver(&transport, "a", settings, &status).run(shutdown, ready_tx));
        assert!(ready_rx.await.unwrap());
        let entity = transport.cell_members(home).first().copied().unwrap();

        assert!(transport.notify(entity, SUBJECT_BUILDINGS_UPDATE, &serde_json::json!({})));
        let added = serde_json::json!({ "data": { "id": 2, "lat": 0.0, "lon": 0.0 } });
        assert!(transport.notify(entity, SUBJECT_BUILDING_UPDATE, &added));
        let removed = serde_json::json!({ "data": { "id": 1, "lat": 0.0, "lon": 0.0 } });
        assert!(transport.notify(entity, SUBJECT_BUILDING_DELETE, &removed));
        let group = GroupInfo {
            id: GroupId::new(),
            name: "AutoGroup_9".into(),
        };
        let moved = serde_json::json!({
            "leave": GroupId::new(),
            "enter": group.id,
            "enter_name": group.name,
        });
        assert!(transport.notify(entity, SUBJECT_GROUP_MOVE, &moved));
        assert!(transport.notify(entity, "something_else", &serde_json::json!(null)));

        time::sleep(Duration::from_millis(100)).await;
        stop.send_replace(true);
        let report = task.await.unwrap();
        assert_eq!(report.points_of_interest, 1);
        assert_eq!(report.malformed_events, 0);
    }
}
