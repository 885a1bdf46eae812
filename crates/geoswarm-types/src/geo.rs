//! Geographic value types: coordinates and grid cells.
//!
//! A [`Cell`] is stored as a pair of integer grid indices rather than as the
//! floored floating-point origin. Two cells are the same cell exactly when
//! their indices are equal, so identity never depends on floating-point
//! equality across different computation paths. Converting a cell back to
//! degrees requires the grid's cell size and lives in `geoswarm-interest`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Mean Earth radius in metres, used for haversine distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A (latitude, longitude) pair in degrees.
///
/// No wraparound handling is done at the antimeridian or the poles.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Coordinate {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
}

impl Coordinate {
    /// Create a coordinate from latitude and longitude in degrees.
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Whether both components are finite numbers.
    pub const fn is_finite(self) -> bool {
        self.lat.is_finite() && self.lon.is_finite()
    }

    /// Return a copy shifted by the given deltas in degrees.
    #[must_use]
    pub fn offset(self, d_lat: f64, d_lon: f64) -> Self {
        Self {
            lat: self.lat + d_lat,
            lon: self.lon + d_lon,
        }
    }

    /// Great-circle distance to `other` in metres (haversine).
    pub fn distance_m(self, other: Self) -> f64 {
        let phi1 = self.lat.to_radians();
        let phi2 = other.lat.to_radians();
        let d_phi = (other.lat - self.lat).to_radians();
        let d_lambda = (other.lon - self.lon).to_radians();

        let a = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }
}

/// A fixed-size grid square, identified by its integer grid indices.
///
/// The cell's south-west corner in degrees is `lat * cell_size`,
/// `lon * cell_size` for the grid that produced it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[ts(export, export_to = "bindings/")]
pub struct Cell {
    /// Latitude index (`floor(lat / cell_size)`).
    pub lat: i64,
    /// Longitude index (`floor(lon / cell_size)`).
    pub lon: i64,
}

impl Cell {
    /// Create a cell from its grid indices.
    pub const fn new(lat: i64, lon: i64) -> Self {
        Self { lat, lon }
    }

    /// The cell shifted by whole-cell steps along each axis.
    #[must_use]
    pub const fn shifted(self, d_lat: i64, d_lon: i64) -> Self {
        Self {
            lat: self.lat.saturating_add(d_lat),
            lon: self.lon.saturating_add(d_lon),
        }
    }

    /// Canonical string key, e.g. `18887_-61210`.
    ///
    /// The key is safe to embed as a single token in a pub/sub subject.
    pub fn key(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.lat, self.lon)
    }
}

/// Error returned when parsing a [`Cell`] key fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cell key: {0}")]
pub struct ParseCellError(pub String);

impl FromStr for Cell {
    type Err = ParseCellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The separator is the first underscore after position 0, so a
        // leading minus sign never splits: `-3_-7` parses as (-3, -7).
        let (lat, lon) = s
            .char_indices()
            .skip(1)
            .find(|&(_, c)| c == '_')
            .and_then(|(idx, _)| Some((s.get(..idx)?, s.get(idx.saturating_add(1)..)?)))
            .ok_or_else(|| ParseCellError(s.to_owned()))?;
        let lat = lat
            .parse()
            .map_err(|e| ParseCellError(format!("{s} ({e})")))?;
        let lon = lon
            .parse()
            .map_err(|e| ParseCellError(format!("{s} ({e})")))?;
        Ok(Self { lat, lon })
    }
}
