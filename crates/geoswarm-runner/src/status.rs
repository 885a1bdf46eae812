//! Process-wide swarm status.
//!
//! Drivers report lifecycle transitions and absorbed errors into a shared
//! [`SwarmStatus`]. All fields are atomics so the hot path never takes a
//! lock; [`SwarmStatus::snapshot`] reads them into a serializable
//! [`StatusSnapshot`] for logging and assertions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle phase of one entity driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverPhase {
    /// Not connected. Initial and terminal phase.
    Disconnected,
    /// Authenticating, connecting and joining the first cells.
    Connecting,
    /// Ticking.
    Active,
    /// Leaving cells and closing the socket.
    Draining,
}

impl fmt::Display for DriverPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// Shared counters for the whole swarm.
#[derive(Debug)]
pub struct SwarmStatus {
    started_at: DateTime<Utc>,

    // Gauges: drivers currently in each phase.
    connecting: AtomicU64,
    active: AtomicU64,
    draining: AtomicU64,

    // Cumulative counts.
    spawned: AtomicU64,
    reached_active: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    ticks: AtomicU64,
    remote_call_failures: AtomicU64,
    malformed_events: AtomicU64,
}

impl SwarmStatus {
    /// Create zeroed status.
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            connecting: AtomicU64::new(0),
            active: AtomicU64::new(0),
            draining: AtomicU64::new(0),
            spawned: AtomicU64::new(0),
            reached_active: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            remote_call_failures: AtomicU64::new(0),
            malformed_events: AtomicU64::new(0),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Record that a driver task was spawned.
    pub fn record_spawned(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    /// Move one driver from `from` to `to`.
    pub fn transition(&self, from: DriverPhase, to: DriverPhase) {
        if let Some(gauge) = self.gauge(from) {
            gauge.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(gauge) = self.gauge(to) {
            gauge.fetch_add(1, Ordering::AcqRel);
        }
        if to == DriverPhase::Active {
            self.reached_active.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record that a driver reached its terminal phase after draining.
    pub fn record_finished(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a driver never became active.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    const fn gauge(&self, phase: DriverPhase) -> Option<&AtomicU64> {
        match phase {
            DriverPhase::Disconnected => None,
            DriverPhase::Connecting => Some(&self.connecting),
            DriverPhase::Active => Some(&self.active),
            DriverPhase::Draining => Some(&self.draining),
        }
    }

    // -----------------------------------------------------------------------
    // Activity
    // -----------------------------------------------------------------------

    /// Record one completed movement tick.
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one absorbed remote-call failure.
    pub fn record_remote_call_failure(&self) {
        self.remote_call_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one dropped malformed event.
    pub fn record_malformed_event(&self) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of drivers currently active.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    /// Read every counter.
    pub fn snapshot(&self) -> StatusSnapshot {
        let taken_at = Utc::now();
        StatusSnapshot {
            taken_at,
            uptime_ms: u64::try_from(taken_at.signed_duration_since(self.started_at).num_milliseconds())
                .unwrap_or(0),
            spawned: self.spawned.load(Ordering::Relaxed),
            connecting: self.connecting.load(Ordering::Acquire),
            active: self.active.load(Ordering::Acquire),
            draining: self.draining.load(Ordering::Acquire),
            reached_active: self.reached_active.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            remote_call_failures: self.remote_call_failures.load(Ordering::Relaxed),
            malformed_events: self.malformed_events.load(Ordering::Relaxed),
        }
    }
}

impl Default for SwarmStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of [`SwarmStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Milliseconds since the status was created.
    pub uptime_ms: u64,
    /// Driver tasks spawned.
    pub spawned: u64,
    /// Drivers currently connecting.
    pub connecting: u64,
    /// Drivers currently active.
    pub active: u64,
    /// Drivers currently draining.
    pub draining: u64,
    /// Drivers that ever became active.
    pub reached_active: u64,
    /// Drivers that drained and disconnected.
    pub finished: u64,
    /// Drivers that never became active.
    pub failed: u64,
    /// Movement ticks completed across all drivers.
    pub ticks: u64,
    /// Remote-call failures absorbed across all drivers.
    pub remote_call_failures: u64,
    /// Malformed inbound events dropped across all drivers.
    pub malformed_events: u64,
}
