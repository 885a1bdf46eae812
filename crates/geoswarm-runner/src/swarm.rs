//! Swarm Orchestrator: batched spawning, shutdown and drain.
//!
//! [`Swarm::run`] spawns `entity_count` drivers in batches of
//! `batch_size`, waits for each batch to report ready (active or failed),
//! pauses between batches, and then runs until the stop future resolves,
//! the absolute run timeout elapses, or someone triggers the
//! [`ShutdownHandle`]. The drain that follows is bounded by
//! `shutdown.drain_timeout_secs`; drivers still running after that are
//! aborted and reported as stuck.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use geoswarm_interest::InterestError;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{Instrument, info, info_span, warn};

use crate::config::SwarmConfig;
use crate::driver::{DriverReport, DriverSettings, EntityDriver};
use crate::movement::RandomWalk;
use crate::status::SwarmStatus;
use crate::transport::{Credentials, Transport};

// -----------------------------------------------------------------------
// Shutdown
// -----------------------------------------------------------------------

/// Why the swarm shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    /// An interrupt signal (or the caller's stop future).
    Signal,
    /// The absolute run timeout elapsed.
    Timeout,
    /// [`ShutdownHandle::trigger`] was called directly.
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Signal => "signal",
            Self::Timeout => "timeout",
            Self::Requested => "requested",
        };
        f.write_str(name)
    }
}

/// One-shot, idempotent shutdown trigger shared by the swarm and its
/// drivers. The first reason wins; later triggers are no-ops.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    reason: Arc<OnceLock<ShutdownReason>>,
    signal: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            reason: Arc::new(OnceLock::new()),
            signal: Arc::new(signal),
        }
    }

    /// Trigger shutdown. Returns `true` only for the first call.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.signal.send_replace(true);
        if first {
            info!(%reason, "swarm shutdown triggered");
        }
        first
    }

    /// A receiver that flips to `true` on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// The reason shutdown was triggered with, if it was.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Resolve once shutdown has been triggered.
    pub async fn triggered(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this only returns on `true`.
        drop(rx.wait_for(|stopped| *stopped).await);
    }
}

// -----------------------------------------------------------------------
// Summary
// -----------------------------------------------------------------------

/// Final account of a swarm run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwarmSummary {
    /// Why the swarm stopped.
    pub reason: ShutdownReason,
    /// Configured entity count.
    pub requested: u32,
    /// Driver tasks spawned.
    pub spawned: u64,
    /// Drivers that became active.
    pub reached_active: u64,
    /// Drivers that failed to authenticate, connect or join their first
    /// cells.
    pub failed: u64,
    /// Active drivers that completed their drain.
    pub drained: u64,
    /// Cells still held by drained drivers. 0 on a clean drain.
    pub cells_remaining: u64,
    /// Leave calls that failed while draining.
    pub failed_leaves: u64,
    /// Drivers aborted after the drain timeout, or whose task panicked.
    pub stuck: u64,
    /// Movement ticks across all drivers.
    pub ticks: u64,
    /// Remote-call failures absorbed across all drivers.
    pub remote_call_failures: u64,
    /// Malformed events dropped across all drivers.
    pub malformed_events: u64,
    /// Wall time from swarm creation to the end of the drain.
    pub elapsed_ms: u64,
    /// When the drain finished.
    pub finished_at: DateTime<Utc>,
}

impl SwarmSummary {
    /// Whether every spawned driver was accounted for with no cells held.
    pub const fn is_clean(&self) -> bool {
        self.stuck == 0 && self.cells_remaining == 0
    }
}

fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

// -----------------------------------------------------------------------
// Swarm
// -----------------------------------------------------------------------

/// A swarm of entity drivers sharing one transport.
pub struct Swarm {
    config: SwarmConfig,
    settings: Arc<DriverSettings>,
    transport: Arc<dyn Transport>,
    status: Arc<SwarmStatus>,
    shutdown: ShutdownHandle,
    drivers: JoinSet<DriverReport>,
    spawned: u32,
    started: Instant,
}

impl fmt::Debug for Swarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swarm")
            .field("requested", &self.config.swarm.entity_count)
            .field("spawned", &self.spawned)
            .field("running", &self.drivers.len())
            .finish_non_exhaustive()
    }
}

impl Swarm {
    /// Create a swarm over `transport`. Nothing is spawned yet.
    ///
    /// # Errors
    ///
    /// Returns [`InterestError`] if the grid settings are unusable.
    pub fn new(config: SwarmConfig, transport: Arc<dyn Transport>) -> Result<Self, InterestError> {
        let settings = Arc::new(DriverSettings::from_config(&config)?);
        Ok(Self {
            config,
            settings,
            transport,
            status: Arc::new(SwarmStatus::new()),
            shutdown: ShutdownHandle::new(),
            drivers: JoinSet::new(),
            spawned: 0,
            started: Instant::now(),
        })
    }

    /// Shared status counters.
    pub fn status(&self) -> Arc<SwarmStatus> {
        Arc::clone(&self.status)
    }

    /// A handle that can trigger shutdown from elsewhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Spawn every configured entity, batch by batch.
    ///
    /// Each batch's drivers start concurrently; the next batch starts once
    /// every driver of the current one has reported ready, plus the
    /// configured pause. No pause follows the last batch. Stops early if
    /// shutdown is triggered. Returns how many drivers were spawned.
    pub async fn spawn_all(&mut self) -> u32 {
        let total = self.config.swarm.entity_count;
        let batch_size = self.config.swarm.batch_size.max(1);
        let pause = self.config.swarm.batch_pause();
        let shutdown = self.shutdown.clone();

        while self.spawned < total && !shutdown.is_triggered() {
            let first = self.spawned;
            let end = first.saturating_add(batch_size).min(total);
            let readies: Vec<_> = (first..end).map(|index| self.spawn_one(index)).collect();
            self.spawned = end;

            let outcomes = tokio::select! {
                outcomes = join_all(readies) => outcomes,
                () = shutdown.triggered() => break,
            };
            let active = outcomes.iter().filter(|r| matches!(r, Ok(true))).count();
            info!(
                first,
                last = end.saturating_sub(1),
                active,
                failed = outcomes.len().saturating_sub(active),
                "spawn batch ready"
            );

            if end < total && !pause.is_zero() {
                tokio::select! {
                    () = time::sleep(pause) => {}
                    () = shutdown.triggered() => break,
                }
            }
        }
        self.spawned
    }

    fn spawn_one(&mut self, index: u32) -> oneshot::Receiver<bool> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let credentials = Credentials {
            identity: self.config.swarm.identity(index),
            secret: self.config.swarm.secret.clone(),
        };
        let movement = RandomWalk::new(&self.config.movement, self.config.swarm.seed, index);
        let driver = EntityDriver::new(
            index,
            credentials,
            Arc::clone(&self.settings),
            Arc::clone(&self.transport),
            Box::new(movement),
            Arc::clone(&self.status),
        );
        self.status.record_spawned();
        self.drivers.spawn(
            driver
                .run(self.shutdown.subscribe(), ready_tx)
                .instrument(info_span!("entity", index)),
        );
        ready_rx
    }

    /// Spawn the swarm and run it until `stop` resolves, the run timeout
    /// elapses or shutdown is triggered, then drain.
    pub async fn run<F>(mut self, stop: F) -> SwarmSummary
    where
        F: Future<Output = ()>,
    {
        let handle = self.shutdown.clone();
        let deadline = self
            .config
            .swarm
            .run_timeout()
            .and_then(|limit| self.started.checked_add(limit));
        let timeout = async move {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(stop);
        tokio::pin!(timeout);

        info!(
            entities = self.config.swarm.entity_count,
            batch_size = self.config.swarm.batch_size,
            policy = ?self.settings.policy,
            "swarm starting"
        );
        // A completed stop or timeout future is never polled again.
        let interrupted = tokio::select! {
            spawned = self.spawn_all() => {
                info!(spawned, "spawning finished");
                None
            }
            () = &mut stop => Some(ShutdownReason::Signal),
            () = &mut timeout => Some(ShutdownReason::Timeout),
        };
        let reason = if interrupted.is_some() {
            interrupted
        } else {
            tokio::select! {
                () = handle.triggered() => None,
                () = &mut stop => Some(ShutdownReason::Signal),
                () = &mut timeout => Some(ShutdownReason::Timeout),
            }
        };
        if let Some(reason) = reason {
            handle.trigger(reason);
        }
        self.drain().await
    }

    /// Trigger shutdown (if nobody has) and wait for every driver to
    /// drain, aborting those that outlast the drain timeout.
    pub async fn drain(mut self) -> SwarmSummary {
        self.shutdown.trigger(ShutdownReason::Requested);
        let reason = self.shutdown.reason().unwrap_or(ShutdownReason::Requested);
        let limit = self.config.shutdown.drain_timeout();
        info!(running = self.drivers.len(), timeout = ?limit, "swarm draining");

        let mut reports = Vec::with_capacity(self.drivers.len());
        let mut lost = 0u64;
        if time::timeout(limit, collect(&mut self.drivers, &mut reports, &mut lost))
            .await
            .is_err()
        {
            let stuck = self.drivers.len();
            warn!(stuck, "drain timed out, aborting remaining drivers");
            lost = lost.saturating_add(to_u64(stuck));
            self.drivers.abort_all();
            while self.drivers.join_next().await.is_some() {}
        }

        let summary = self.summarize(reason, &reports, lost);
        info!(
            reason = %summary.reason,
            reached_active = summary.reached_active,
            failed = summary.failed,
            drained = summary.drained,
            stuck = summary.stuck,
            cells_remaining = summary.cells_remaining,
            elapsed_ms = summary.elapsed_ms,
            "swarm stopped"
        );
        summary
    }

    fn summarize(&self, reason: ShutdownReason, reports: &[DriverReport], stuck: u64) -> SwarmSummary {
        let sum = |f: fn(&DriverReport) -> u64| reports.iter().map(f).fold(0u64, u64::saturating_add);
        let drained = reports.iter().filter(|r| r.reached_active()).count();
        SwarmSummary {
            reason,
            requested: self.config.swarm.entity_count,
            spawned: u64::from(self.spawned),
            reached_active: to_u64(drained),
            failed: to_u64(reports.len().saturating_sub(drained)),
            drained: to_u64(drained),
            cells_remaining: sum(|r| to_u64(r.cells_remaining)),
            failed_leaves: sum(|r| r.failed_leaves),
            stuck,
            ticks: sum(|r| r.ticks),
            remote_call_failures: sum(|r| r.remote_call_failures),
            malformed_events: sum(|r| r.malformed_events),
            elapsed_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            finished_at: Utc::now(),
        }
    }
}

async fn collect(drivers: &mut JoinSet<DriverReport>, reports: &mut Vec<DriverReport>, lost: &mut u64) {
    while let Some(joined) = drivers.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => {
                warn!(error = %e, "driver task ended abnormally");
                *lost = lost.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn first_trigger_wins() {
        let handle = ShutdownHandle::new();
        let rx = handle.subscribe();
        assert!(!handle.is_triggered());
        assert!(handle.trigger(ShutdownReason::Timeout));
        assert!(!handle.trigger(ShutdownReason::Signal));
        assert_eq!(handle.reason(), Some(ShutdownReason::Timeout));
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn triggered_resolves_for_late_waiters() {
        let handle = ShutdownHandle::new();
        handle.trigger(ShutdownReason::Requested);
        handle.triggered().await;
        assert_eq!(ShutdownReason::Requested.to_string(), "requested");
    }

    #[test]
    fn summary_serializes_reason_in_snake_case() {
        let summary = SwarmSummary {
            reason: ShutdownReason::Signal,
            requested: 1,
            spawned: 1,
            reached_active: 1,
            failed: 0,
            drained: 1,
            cells_remaining: 0,
            failed_leaves: 0,
            stuck: 0,
            ticks: 3,
            remote_call_failures: 0,
            malformed_events: 0,
            elapsed_ms: 10,
            finished_at: Utc::now(),
        };
        assert!(summary.is_clean());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["reason"], "signal");
    }
}
