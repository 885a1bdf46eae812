//! Shared type definitions for the Geoswarm interest-management engine.
//!
//! This crate is the single source of truth for the values that flow
//! between the interest engine, the swarm runner and the realtime
//! transport. Wire types are exported to `TypeScript` via `ts-rs` so the
//! browser map client decodes the same shapes.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for entities and groups
//! - [`geo`] -- Coordinates and integer-indexed grid cells
//! - [`wire`] -- Remote-call bodies, stream messages and notifications

pub mod geo;
pub mod ids;
pub mod wire;

// Re-export all public types at crate root for convenience.
pub use geo::{Cell, Coordinate, EARTH_RADIUS_M, ParseCellError};
pub use ids::{EntityId, GroupId};
pub use wire::{
    BuildingNotice, CellRequest, Classification, GroupInfo, GroupMove, LocationBroadcast,
    PROC_GET_BUILDINGS, PROC_JOIN_CELL, PROC_LEAVE_CELL, PROC_SEND_LOCATION, PointOfInterest,
    PresenceEvent, SUBJECT_BUILDING_DELETE, SUBJECT_BUILDING_UPDATE, SUBJECT_BUILDINGS_UPDATE,
    SUBJECT_GROUP_MOVE, StreamMessage,
};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation for the wire types.

    #[test]
    fn export_bindings() {
        // ts-rs writes the files to `bindings/` relative to the crate root.
        use ts_rs::TS;

        let _ = crate::ids::EntityId::export_all();
        let _ = crate::ids::GroupId::export_all();
        let _ = crate::geo::Coordinate::export_all();
        let _ = crate::geo::Cell::export_all();
        let _ = crate::wire::CellRequest::export_all();
        let _ = crate::wire::LocationBroadcast::export_all();
        let _ = crate::wire::StreamMessage::export_all();
        let _ = crate::wire::PresenceEvent::export_all();
        let _ = crate::wire::PointOfInterest::export_all();
        let _ = crate::wire::BuildingNotice::export_all();
        let _ = crate::wire::GroupInfo::export_all();
        let _ = crate::wire::GroupMove::export_all();
        let _ = crate::wire::Classification::export_all();
    }
}
