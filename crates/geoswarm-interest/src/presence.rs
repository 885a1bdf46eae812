//! Presence Mirror: a local cache of remote entities seen on subscribed cells.
//!
//! Records are keyed by cell and then by remote entity id, so an entity
//! observed in two overlapping cells has two records. Records age out by
//! staleness alone: [`PresenceMirror::evict_stale`] must be called on its
//! own cadence, because a remote entity that stops reporting produces no
//! event at all.
//!
//! The mirror is not synchronised. Each driver owns one and is its only
//! writer.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use geoswarm_types::{Cell, Classification, Coordinate, EntityId};
use tracing::trace;

/// Timing and range limits for a [`PresenceMirror`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MirrorConfig {
    /// Position writes for one record closer together than this are
    /// debounced. Receipt time is still refreshed.
    pub min_update_interval: Duration,
    /// Records older than this are removed by [`PresenceMirror::evict_stale`].
    pub staleness: Duration,
    /// `Other` observations farther than this from the viewpoint are not
    /// kept. `None` disables the filter.
    pub visibility_radius_m: Option<f64>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            min_update_interval: Duration::from_millis(250),
            staleness: Duration::from_secs(2),
            visibility_radius_m: None,
        }
    }
}

/// Last known state of one remote entity in one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    /// The remote entity.
    pub remote_id: EntityId,
    /// The cell stream the observation arrived on.
    pub cell: Cell,
    /// Last accepted position.
    pub coordinate: Coordinate,
    /// Relation of the remote entity to the local one.
    pub classification: Classification,
    /// When the record was last observed, debounced or not.
    pub last_update: Instant,
    /// When `coordinate` was last written.
    pub position_updated_at: Instant,
}

/// What [`PresenceMirror::observe`] did with an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// A new record was created.
    Inserted,
    /// An existing record's position was overwritten.
    Updated,
    /// An existing record was refreshed but its position kept.
    Debounced,
    /// The observation was beyond the visibility radius and dropped.
    OutOfRange,
}

/// Per-entity cache of remote presence records.
#[derive(Debug, Clone, Default)]
pub struct PresenceMirror {
    config: MirrorConfig,
    viewpoint: Option<Coordinate>,
    cells: BTreeMap<Cell, HashMap<EntityId, PresenceRecord>>,
}

impl PresenceMirror {
    /// Create an empty mirror.
    pub fn new(config: MirrorConfig) -> Self {
        Self {
            config,
            viewpoint: None,
            cells: BTreeMap::new(),
        }
    }

    /// The limits this mirror applies.
    pub const fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Set the local entity's position, used by the visibility filter.
    pub const fn set_viewpoint(&mut self, viewpoint: Coordinate) {
        self.viewpoint = Some(viewpoint);
    }

    /// Record that `remote_id` was seen at `coordinate` on `cell`'s stream.
    pub fn observe(
        &mut self,
        remote_id: EntityId,
        cell: Cell,
        coordinate: Coordinate,
        classification: Classification,
        now: Instant,
    ) -> ObserveOutcome {
        if classification == Classification::Other && self.out_of_range(coordinate) {
            if let Some(records) = self.cells.get_mut(&cell) {
                records.remove(&remote_id);
                if records.is_empty() {
                    self.cells.remove(&cell);
                }
            }
            return ObserveOutcome::OutOfRange;
        }

        let min_interval = self.config.min_update_interval;
        let records = self.cells.entry(cell).or_default();
        match records.get_mut(&remote_id) {
            Some(record) => {
                record.last_update = now;
                record.classification = classification;
                if now.saturating_duration_since(record.position_updated_at) < min_interval {
                    return ObserveOutcome::Debounced;
                }
                record.coordinate = coordinate;
                record.position_updated_at = now;
                ObserveOutcome::Updated
            }
            None => {
                records.insert(
                    remote_id,
                    PresenceRecord {
                        remote_id,
                        cell,
                        coordinate,
                        classification,
                        last_update: now,
                        position_updated_at: now,
                    },
                );
                ObserveOutcome::Inserted
            }
        }
    }

    fn out_of_range(&self, coordinate: Coordinate) -> bool {
        match (self.viewpoint, self.config.visibility_radius_m) {
            (Some(viewpoint), Some(radius)) => viewpoint.distance_m(coordinate) > radius,
            _ => false,
        }
    }

    /// Remove every record not observed within the staleness threshold.
    ///
    /// Returns the number of records removed.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let staleness = self.config.staleness;
        let mut evicted = 0usize;
        self.cells.retain(|cell, records| {
            let before = records.len();
            records.retain(|_, record| now.saturating_duration_since(record.last_update) <= staleness);
            let removed = before.saturating_sub(records.len());
            if removed > 0 {
                trace!(%cell, removed, "evicted stale presence");
            }
            evicted = evicted.saturating_add(removed);
            !records.is_empty()
        });
        evicted
    }

    /// Remove `remote_id` from every cell after a presence-leave event.
    pub fn remove_on_departure(&mut self, remote_id: EntityId) -> usize {
        let mut removed = 0usize;
        self.cells.retain(|_, records| {
            if records.remove(&remote_id).is_some() {
                removed = removed.saturating_add(1);
            }
            !records.is_empty()
        });
        removed
    }

    /// Remove every record in `cell`, after the local entity left it.
    pub fn drop_cell(&mut self, cell: Cell) -> usize {
        self.cells.remove(&cell).map_or(0, |records| records.len())
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// The record for `remote_id` in `cell`, if any.
    pub fn get(&self, cell: Cell, remote_id: EntityId) -> Option<&PresenceRecord> {
        self.cells.get(&cell)?.get(&remote_id)
    }

    /// Iterate over every record.
    pub fn records(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.cells.values().flat_map(HashMap::values)
    }

    /// Total number of records across all cells.
    pub fn len(&self) -> usize {
        self.cells.values().map(HashMap::len).sum()
    }

    /// Whether the mirror holds no records.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of cells with at least one record.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn after(t0: Instant, ms: u64) -> Instant {
        t0.checked_add(Duration::from_millis(ms)).unwrap()
    }

    fn mirror() -> PresenceMirror {
        PresenceMirror::new(MirrorConfig::default())
    }

    #[test]
    fn first_observation_inserts() {
        let mut mirror = mirror();
        let id = EntityId::new();
        let cell = Cell::new(1, 2);
        let t0 = Instant::now();

        let outcome = mirror.observe(id, cell, Coordinate::new(1.0, 2.0), Classification::Other, t0);
        assert_eq!(outcome, ObserveOutcome::Inserted);
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror.get(cell, id).unwrap().last_update, t0);
    }

    #[test]
    fn rapid_updates_keep_position_but_refresh_receipt() {
        let mut mirror = mirror();
        let id = EntityId::new();
        let cell = Cell::new(0, 0);
        let t0 = Instant::now();
        let first = Coordinate::new(0.001, 0.001);
        let second = Coordinate::new(0.0015, 0.0015);

        mirror.observe(id, cell, first, Classification::Other, t0);
        let t1 = after(t0, 100);
        let outcome = mirror.observe(id, cell, second, Classification::Other, t1);
        assert_eq!(outcome, ObserveOutcome::Debounced);
        let record = mirror.get(cell, id).unwrap();
        assert_eq!(record.coordinate, first);
        assert_eq!(record.last_update, t1);

        let t2 = after(t0, 300);
        let outcome = mirror.observe(id, cell, second, Classification::Other, t2);
        assert_eq!(outcome, ObserveOutcome::Updated);
        assert_eq!(mirror.get(cell, id).unwrap().coordinate, second);
    }

    #[test]
    fn stale_records_are_evicted() {
        let mut mirror = mirror();
        let stale = EntityId::new();
        let fresh = EntityId::new();
        let t0 = Instant::now();

        mirror.observe(stale, Cell::new(0, 0), Coordinate::default(), Classification::Other, t0);
        mirror.observe(
            fresh,
            Cell::new(0, 1),
            Coordinate::default(),
            Classification::SameGroup,
            after(t0, 1500),
        );

        assert_eq!(mirror.evict_stale(after(t0, 2000)), 0);
        assert_eq!(mirror.evict_stale(after(t0, 2001)), 1);
        assert!(mirror.get(Cell::new(0, 0), stale).is_none());
        assert!(mirror.get(Cell::new(0, 1), fresh).is_some());
        assert_eq!(mirror.cell_count(), 1);
    }

    #[test]
    fn departure_removes_from_every_cell() {
        let mut mirror = mirror();
        let id = EntityId::new();
        let other = EntityId::new();
        let t0 = Instant::now();
        for lon in 0..3 {
            mirror.observe(id, Cell::new(0, lon), Coordinate::default(), Classification::Other, t0);
        }
        mirror.observe(other, Cell::new(0, 0), Coordinate::default(), Classification::Other, t0);

        assert_eq!(mirror.remove_on_departure(id), 3);
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror.remove_on_departure(id), 0);
    }

    #[test]
    fn far_others_are_filtered_but_group_members_are_kept() {
        let mut mirror = PresenceMirror::new(MirrorConfig {
            visibility_radius_m: Some(222.0),
            ..MirrorConfig::default()
        });
        let here = Coordinate::new(37.7749, -122.4194);
        mirror.set_viewpoint(here);
        let cell = Cell::new(18887, -61210);
        let far = here.offset(0.01, 0.0);
        let t0 = Instant::now();

        let other = EntityId::new();
        mirror.observe(other, cell, here.offset(0.0005, 0.0), Classification::Other, t0);
        assert_eq!(mirror.len(), 1);
        // Moving out of range removes the existing record.
        let outcome = mirror.observe(other, cell, far, Classification::Other, after(t0, 500));
        assert_eq!(outcome, ObserveOutcome::OutOfRange);
        assert!(mirror.is_empty());

        let friend = EntityId::new();
        let outcome = mirror.observe(friend, cell, far, Classification::SameGroup, t0);
        assert_eq!(outcome, ObserveOutcome::Inserted);
    }

    #[test]
    fn dropping_a_cell_removes_only_that_cell() {
        let mut mirror = mirror();
        let t0 = Instant::now();
        mirror.observe(EntityId::new(), Cell::new(0, 0), Coordinate::default(), Classification::Other, t0);
        mirror.observe(EntityId::new(), Cell::new(0, 0), Coordinate::default(), Classification::Other, t0);
        mirror.observe(EntityId::new(), Cell::new(5, 5), Coordinate::default(), Classification::Other, t0);

        assert_eq!(mirror.drop_cell(Cell::new(0, 0)), 2);
        assert_eq!(mirror.drop_cell(Cell::new(0, 0)), 0);
        assert_eq!(mirror.len(), 1);
        mirror.clear();
        assert!(mirror.is_empty());
    }
}
