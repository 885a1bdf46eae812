//! Randomised checks of the grid, reconciler and mirror invariants.
//!
//! Every test draws from a fixed seed so failures reproduce.

#![allow(clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use geoswarm_interest::{
    FULL_NEIGHBORHOOD_CELLS, Grid, InterestPolicy, InterestSet, MAX_DIRECTIONAL_CELLS,
    MirrorConfig, PresenceMirror, ReconcileStrategy, set_difference,
};
use geoswarm_types::{Cell, Classification, Coordinate, EntityId};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const CELL_SIZE: f64 = 0.002;
const SAMPLES: usize = 2_000;

fn grid() -> Grid {
    Grid::new(CELL_SIZE).unwrap()
}

fn random_coordinate(rng: &mut SmallRng) -> Coordinate {
    Coordinate::new(rng.random_range(-80.0..80.0), rng.random_range(-170.0..170.0))
}

#[test]
fn cell_of_is_stable_inside_the_cell() {
    let grid = grid();
    let mut rng = SmallRng::seed_from_u64(7);
    for _ in 0..SAMPLES {
        let coord = random_coordinate(&mut rng);
        let cell = grid.cell_of(coord);
        let origin = grid.origin(cell);
        // Stay clear of the boundary lines, where the origin itself is a
        // rounded product.
        let inside = origin.offset(
            rng.random_range(0.05..0.95) * CELL_SIZE,
            rng.random_range(0.05..0.95) * CELL_SIZE,
        );
        assert_eq!(grid.cell_of(inside), cell, "{coord:?} -> {inside:?}");
        assert_eq!(grid.cell_of(coord), cell);
    }
}

#[test]
fn policies_respect_their_cell_counts() {
    let grid = grid();
    let mut rng = SmallRng::seed_from_u64(11);
    for _ in 0..SAMPLES {
        let coord = random_coordinate(&mut rng);
        let cell = grid.cell_of(coord);
        let directional = grid.needed_cells(coord, cell, InterestPolicy::DirectionalMinimal);
        assert!(directional.contains(&cell));
        assert!(directional.len() <= MAX_DIRECTIONAL_CELLS);
        let full = grid.needed_cells(coord, cell, InterestPolicy::FullNeighborhood);
        assert_eq!(full.len(), FULL_NEIGHBORHOOD_CELLS);
    }
}

#[test]
fn longitude_crossing_swaps_one_column() {
    let grid = grid();
    let start = Coordinate::new(37.7749, -122.4194);
    let mut interest = InterestSet::new(
        InterestPolicy::FullNeighborhood,
        ReconcileStrategy::SetDifference,
    );
    let cell = grid.cell_of(start);
    let first = interest.reconcile(cell, grid.needed_cells(start, cell, InterestPolicy::FullNeighborhood));
    assert_eq!((first.to_join.len(), first.to_leave.len()), (9, 0));

    let moved = start.offset(0.0, CELL_SIZE);
    let next = grid.cell_of(moved);
    assert_eq!(next, cell.shifted(0, 1));
    let plan = interest.reconcile(next, grid.needed_cells(moved, next, InterestPolicy::FullNeighborhood));
    assert_eq!(plan.to_join.len(), 3);
    assert_eq!(plan.to_leave.len(), 3);
    assert!(plan.to_leave.iter().all(|c| c.lon == cell.shifted(0, -1).lon));
    assert!(plan.to_join.iter().all(|c| c.lon == cell.shifted(0, 2).lon));
}

#[test]
fn consecutive_reconciles_end_at_the_last_set() {
    let grid = grid();
    let mut rng = SmallRng::seed_from_u64(23);
    for policy in [InterestPolicy::FullNeighborhood, InterestPolicy::DirectionalMinimal] {
        let mut interest = InterestSet::new(policy, ReconcileStrategy::SetDifference);
        let mut coord = Coordinate::new(37.7749, -122.4194);
        for _ in 0..SAMPLES {
            coord = coord.offset(
                rng.random_range(-0.005..0.005),
                rng.random_range(-0.005..0.005),
            );
            let cell = grid.cell_of(coord);
            let required = grid.needed_cells(coord, cell, policy);
            let before = interest.current().clone();
            let plan = interest.reconcile(cell, required.clone());

            // Applying the plan to the previous set yields the new one.
            let mut applied: BTreeSet<Cell> = before;
            for leave in &plan.to_leave {
                assert!(applied.remove(leave));
            }
            for join in &plan.to_join {
                assert!(applied.insert(*join));
            }
            assert_eq!(applied, required);
            assert_eq!(interest.current(), &required);
            assert!(interest.reconcile(cell, required).is_empty());
        }
    }
}

#[test]
fn slab_walk_matches_set_difference() {
    let grid = grid();
    let mut rng = SmallRng::seed_from_u64(31);
    let policy = InterestPolicy::FullNeighborhood;
    let mut slab = InterestSet::new(policy, ReconcileStrategy::Slab);
    let mut general = InterestSet::new(policy, ReconcileStrategy::SetDifference);
    let mut coord = Coordinate::new(10.0005, 20.0005);

    for _ in 0..SAMPLES {
        // One axis at a time, at most one cell per step.
        let step = rng.random_range(-CELL_SIZE..CELL_SIZE);
        coord = if rng.random_bool(0.5) {
            coord.offset(step, 0.0)
        } else {
            coord.offset(0.0, step)
        };
        let cell = grid.cell_of(coord);
        let required = grid.needed_cells(coord, cell, policy);
        let expected = set_difference(general.current(), &required);
        let plan = slab.reconcile(cell, required.clone());
        general.reconcile(cell, required);

        let as_set = |cells: &[Cell]| cells.iter().copied().collect::<BTreeSet<_>>();
        assert_eq!(as_set(&plan.to_join), as_set(&expected.to_join));
        assert_eq!(as_set(&plan.to_leave), as_set(&expected.to_leave));
        assert_eq!(slab.current(), general.current());
    }
}

#[test]
fn unobserved_records_are_gone_after_eviction() {
    let config = MirrorConfig {
        staleness: Duration::from_millis(2_000),
        ..MirrorConfig::default()
    };
    let mut mirror = PresenceMirror::new(config);
    let mut rng = SmallRng::seed_from_u64(47);
    let t0 = Instant::now();
    let mut last_seen = Vec::new();

    for _ in 0..200 {
        let id = EntityId::new();
        let cell = Cell::new(rng.random_range(0..4), rng.random_range(0..4));
        let at_ms = rng.random_range(0..5_000u64);
        let at = t0.checked_add(Duration::from_millis(at_ms)).unwrap();
        mirror.observe(id, cell, Coordinate::default(), Classification::Other, at);
        last_seen.push((id, cell, at_ms));
    }

    let now_ms = 5_000u64;
    mirror.evict_stale(t0.checked_add(Duration::from_millis(now_ms)).unwrap());
    for (id, cell, at_ms) in last_seen {
        let present = mirror.get(cell, id).is_some();
        assert_eq!(present, now_ms.saturating_sub(at_ms) <= 2_000, "record seen at {at_ms}ms");
    }
}
