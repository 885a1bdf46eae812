//! Grid indexing: coordinates to cells, and cells to interest sets.
//!
//! Everything here is a pure function of its inputs. A [`Grid`] only
//! carries the validated cell size; it holds no per-entity state and is
//! freely copied between drivers.

use std::collections::BTreeSet;

use geoswarm_types::{Cell, Coordinate};
use serde::{Deserialize, Serialize};

use crate::error::InterestError;

/// Number of cells returned by [`InterestPolicy::FullNeighborhood`].
pub const FULL_NEIGHBORHOOD_CELLS: usize = 9;

/// Upper bound on cells returned by [`InterestPolicy::DirectionalMinimal`].
pub const MAX_DIRECTIONAL_CELLS: usize = 4;

/// Strategy deciding which cells an entity subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestPolicy {
    /// The 3x3 block of cells centred on the entity's cell.
    FullNeighborhood,
    /// The entity's cell plus the neighbours on the side(s) of the cell
    /// origin the entity is offset towards. At most four cells.
    ///
    /// An offset of exactly zero on an axis adds no neighbour on that
    /// axis, so an entity sitting on a cell's origin line is not covered
    /// by the cell across that line. This gap is part of the policy.
    #[default]
    DirectionalMinimal,
}

impl InterestPolicy {
    /// Neighbourhood radius in cells, for policies that have a fixed one.
    pub const fn radius(self) -> Option<i64> {
        match self {
            Self::FullNeighborhood => Some(1),
            Self::DirectionalMinimal => None,
        }
    }
}

/// A uniform square grid over latitude/longitude degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    cell_size: f64,
}

impl Grid {
    /// Create a grid with the given cell size in degrees.
    ///
    /// # Errors
    ///
    /// Returns [`InterestError::InvalidCellSize`] if the size is not a
    /// finite, strictly positive number.
    pub fn new(cell_size: f64) -> Result<Self, InterestError> {
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(InterestError::InvalidCellSize(cell_size));
        }
        Ok(Self { cell_size })
    }

    /// The cell size in degrees.
    pub const fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// The cell containing `coord` (`floor(x / cell_size)` per axis).
    pub fn cell_of(&self, coord: Coordinate) -> Cell {
        Cell::new(
            floor_index(coord.lat / self.cell_size),
            floor_index(coord.lon / self.cell_size),
        )
    }

    /// The south-west corner of `cell` in degrees.
    #[allow(clippy::cast_precision_loss)]
    pub fn origin(&self, cell: Cell) -> Coordinate {
        Coordinate::new(
            cell.lat as f64 * self.cell_size,
            cell.lon as f64 * self.cell_size,
        )
    }

    /// Whether `coord` falls inside `cell` according to [`Self::cell_of`].
    pub fn contains(&self, cell: Cell, coord: Coordinate) -> bool {
        self.cell_of(coord) == cell
    }

    /// The set of cells an entity at `coord`, whose current cell is `cell`,
    /// must be subscribed to under `policy`.
    pub fn needed_cells(
        &self,
        coord: Coordinate,
        cell: Cell,
        policy: InterestPolicy,
    ) -> BTreeSet<Cell> {
        match policy {
            InterestPolicy::FullNeighborhood => neighborhood(cell, 1),
            InterestPolicy::DirectionalMinimal => self.directional(coord, cell),
        }
    }

    fn directional(&self, coord: Coordinate, cell: Cell) -> BTreeSet<Cell> {
        let origin = self.origin(cell);
        let lat_step = sign_step(coord.lat - origin.lat);
        let lon_step = sign_step(coord.lon - origin.lon);

        let mut cells = BTreeSet::new();
        cells.insert(cell);
        if lat_step != 0 {
            cells.insert(cell.shifted(lat_step, 0));
        }
        if lon_step != 0 {
            cells.insert(cell.shifted(0, lon_step));
        }
        if lat_step != 0 && lon_step != 0 {
            cells.insert(cell.shifted(lat_step, lon_step));
        }
        debug_assert!(cells.len() <= MAX_DIRECTIONAL_CELLS);
        cells
    }
}

/// All cells within `radius` cells of `center` on both axes.
pub fn neighborhood(center: Cell, radius: i64) -> BTreeSet<Cell> {
    let mut cells = BTreeSet::new();
    for d_lat in radius.saturating_neg()..=radius {
        for d_lon in radius.saturating_neg()..=radius {
            cells.insert(center.shifted(d_lat, d_lon));
        }
    }
    cells
}

// Float-to-int casts saturate; the grid does not handle wraparound anyway.
#[allow(clippy::cast_possible_truncation)]
fn floor_index(value: f64) -> i64 {
    value.floor() as i64
}

fn sign_step(offset: f64) -> i64 {
    if offset > 0.0 {
        1
    } else if offset < 0.0 {
        -1
    } else {
        0
    }
}
