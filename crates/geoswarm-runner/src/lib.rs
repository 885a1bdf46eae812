//! Swarm simulator for location-based realtime backends.
//!
//! The runner spawns many simulated entities, each with its own account,
//! realtime socket and random walk. Every tick an entity recomputes the
//! grid cells it must watch, joins and leaves cell streams to match, and
//! broadcasts its position. Incoming positions feed a bounded presence
//! mirror; notifications keep a points-of-interest cache current.
//!
//! # Architecture
//!
//! ```text
//! Swarm --spawns--> EntityDriver --Socket--> Transport (NATS | loopback)
//!                       |
//!                       +-- Grid / InterestSet / PresenceMirror (geoswarm-interest)
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod loopback;
pub mod movement;
pub mod nats;
pub mod status;
pub mod swarm;
pub mod transport;
