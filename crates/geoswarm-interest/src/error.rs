//! Error types for the `geoswarm-interest` crate.

/// Errors that can occur when building interest-management components.
#[derive(Debug, thiserror::Error)]
pub enum InterestError {
    /// The cell size must be a finite, strictly positive number of degrees.
    #[error("invalid cell size: {0} (must be finite and > 0)")]
    InvalidCellSize(f64),
}
