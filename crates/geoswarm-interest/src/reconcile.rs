//! Interest-set reconciliation.
//!
//! An [`InterestSet`] is the set of cells one entity is subscribed to. Each
//! movement tick the caller computes the newly required set and calls
//! [`InterestSet::reconcile`], which returns the joins and leaves to issue
//! and then records the required set as current. The caller issues the
//! remote calls independently and reports failed joins back through
//! [`InterestSet::forget`] so they are planned again on the next tick.
//!
//! Two strategies produce the plan:
//!
//! - [`ReconcileStrategy::SetDifference`] -- `required - current` joins and
//!   `current - required` leaves. Correct for any movement.
//! - [`ReconcileStrategy::Slab`] -- under the full-neighbourhood policy,
//!   a single-cell step along one axis only swaps the trailing row or
//!   column for the leading one. Any other step (diagonal, multi-cell, a
//!   set with forgotten cells, or a required set that is not the
//!   neighbourhood of the anchor) falls back to set difference.

use std::collections::BTreeSet;

use geoswarm_types::Cell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::grid::{InterestPolicy, neighborhood};

/// How reconciliation plans are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStrategy {
    /// General set difference between current and required cells.
    #[default]
    SetDifference,
    /// Row/column swap for single-axis single-cell steps.
    Slab,
}

/// The remote operations needed to move from one interest set to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Cells to subscribe to.
    pub to_join: Vec<Cell>,
    /// Cells to unsubscribe from.
    pub to_leave: Vec<Cell>,
}

impl ReconcilePlan {
    /// Whether the plan contains no operations.
    pub fn is_empty(&self) -> bool {
        self.to_join.is_empty() && self.to_leave.is_empty()
    }

    /// Total number of operations in the plan.
    pub fn len(&self) -> usize {
        self.to_join.len().saturating_add(self.to_leave.len())
    }
}

/// Plan the joins and leaves that turn `current` into `required`.
pub fn set_difference(current: &BTreeSet<Cell>, required: &BTreeSet<Cell>) -> ReconcilePlan {
    ReconcilePlan {
        to_join: required.difference(current).copied().collect(),
        to_leave: current.difference(required).copied().collect(),
    }
}

/// Plan a move of a square neighbourhood of `radius` from `from` to `to`.
///
/// Returns `None` unless the step is zero or exactly one cell along a
/// single axis; callers fall back to [`set_difference`] in that case.
pub fn slab_difference(from: Cell, to: Cell, radius: i64) -> Option<ReconcilePlan> {
    let d_lat = to.lat.checked_sub(from.lat)?;
    let d_lon = to.lon.checked_sub(from.lon)?;

    match (d_lat, d_lon) {
        (0, 0) => Some(ReconcilePlan::default()),
        (step @ (-1 | 1), 0) => {
            // Trailing row of the old block, leading row of the new one.
            let trailing = from.lat.checked_sub(step.checked_mul(radius)?)?;
            let leading = to.lat.checked_add(step.checked_mul(radius)?)?;
            Some(ReconcilePlan {
                to_join: span(from.lon, radius)
                    .map(|lon| Cell::new(leading, lon))
                    .collect(),
                to_leave: span(from.lon, radius)
                    .map(|lon| Cell::new(trailing, lon))
                    .collect(),
            })
        }
        (0, step @ (-1 | 1)) => {
            let trailing = from.lon.checked_sub(step.checked_mul(radius)?)?;
            let leading = to.lon.checked_add(step.checked_mul(radius)?)?;
            Some(ReconcilePlan {
                to_join: span(from.lat, radius)
                    .map(|lat| Cell::new(lat, leading))
                    .collect(),
                to_leave: span(from.lat, radius)
                    .map(|lat| Cell::new(lat, trailing))
                    .collect(),
            })
        }
        _ => None,
    }
}

fn span(center: i64, radius: i64) -> std::ops::RangeInclusive<i64> {
    center.saturating_sub(radius)..=center.saturating_add(radius)
}

/// One entity's cell subscriptions.
#[derive(Debug, Clone)]
pub struct InterestSet {
    policy: InterestPolicy,
    strategy: ReconcileStrategy,
    current: BTreeSet<Cell>,
    /// Cell the entity was in when `current` was last committed.
    anchor: Option<Cell>,
}

impl InterestSet {
    /// Create an empty interest set.
    pub const fn new(policy: InterestPolicy, strategy: ReconcileStrategy) -> Self {
        Self {
            policy,
            strategy,
            current: BTreeSet::new(),
            anchor: None,
        }
    }

    /// The policy this set was created for.
    pub const fn policy(&self) -> InterestPolicy {
        self.policy
    }

    /// Cells currently subscribed to.
    pub const fn current(&self) -> &BTreeSet<Cell> {
        &self.current
    }

    /// Number of subscribed cells.
    pub fn len(&self) -> usize {
        self.current.len()
    }

    /// Whether no cells are subscribed.
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Whether `cell` is subscribed.
    pub fn contains(&self, cell: &Cell) -> bool {
        self.current.contains(cell)
    }

    /// Plan the transition to `required` for an entity now in `anchor`,
    /// then record `required` as the current set.
    ///
    /// Reconciling the same `required` twice yields an empty plan the
    /// second time.
    pub fn reconcile(&mut self, anchor: Cell, required: BTreeSet<Cell>) -> ReconcilePlan {
        let plan = self
            .slab_plan(anchor, &required)
            .unwrap_or_else(|| set_difference(&self.current, &required));

        self.current = required;
        self.anchor = Some(anchor);
        plan
    }

    /// The slab plan is only valid when both the held set and `required`
    /// are exactly the square neighbourhoods of their anchors.
    fn slab_plan(&self, anchor: Cell, required: &BTreeSet<Cell>) -> Option<ReconcilePlan> {
        if self.strategy != ReconcileStrategy::Slab {
            return None;
        }
        let radius = self.policy.radius()?;
        let previous = self.anchor?;
        if self.current != neighborhood(previous, radius)
            || *required != neighborhood(anchor, radius)
        {
            return None;
        }
        let plan = slab_difference(previous, anchor, radius);
        if plan.is_none() {
            debug!(
                from = %previous,
                to = %anchor,
                "step is not a single-axis unit move, using set difference"
            );
        }
        plan
    }

    /// Drop `cell` from the current set without a remote call.
    ///
    /// Used when a join failed: the next reconcile plans it again if it is
    /// still required. Returns whether the cell was present.
    pub fn forget(&mut self, cell: Cell) -> bool {
        self.current.remove(&cell)
    }

    /// Remove and return every subscribed cell, leaving the set empty.
    pub fn drain(&mut self) -> Vec<Cell> {
        self.anchor = None;
        std::mem::take(&mut self.current).into_iter().collect()
    }
}
