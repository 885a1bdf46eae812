//! Spatial interest management for Geoswarm entities.
//!
//! Everything in this crate is synchronous and free of I/O. A driver owns
//! one [`InterestSet`] and optionally one [`PresenceMirror`]; the shared
//! [`Grid`] is a plain value.
//!
//! # Modules
//!
//! - [`grid`] -- Coordinate to cell mapping and interest policies
//! - [`reconcile`] -- Join/leave planning between interest sets
//! - [`presence`] -- Staleness-evicted cache of remote entities
//! - [`error`] -- Construction errors

pub mod error;
pub mod grid;
pub mod presence;
pub mod reconcile;

pub use error::InterestError;
pub use grid::{FULL_NEIGHBORHOOD_CELLS, Grid, InterestPolicy, MAX_DIRECTIONAL_CELLS, neighborhood};
pub use presence::{MirrorConfig, ObserveOutcome, PresenceMirror, PresenceRecord};
pub use reconcile::{InterestSet, ReconcilePlan, ReconcileStrategy, set_difference, slab_difference};
