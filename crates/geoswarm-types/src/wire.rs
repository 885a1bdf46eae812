//! JSON payloads exchanged with the realtime transport.
//!
//! Outbound payloads are the bodies of remote calls (`rpcjoincell`,
//! `rpcleavecell`, `rpcsendlocation`). Inbound payloads arrive on cell
//! streams, presence streams and the per-user notification channel.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::geo::{Cell, Coordinate};
use crate::ids::{EntityId, GroupId};

/// Remote procedure that subscribes the caller to a cell stream.
pub const PROC_JOIN_CELL: &str = "rpcjoincell";
/// Remote procedure that unsubscribes the caller from a cell stream.
pub const PROC_LEAVE_CELL: &str = "rpcleavecell";
/// Remote procedure that publishes the caller's position to its cell and group.
pub const PROC_SEND_LOCATION: &str = "rpcsendlocation";
/// Remote procedure returning every point of interest on the map.
pub const PROC_GET_BUILDINGS: &str = "get_buildings";

/// Notification subject asking clients to refetch all points of interest.
pub const SUBJECT_BUILDINGS_UPDATE: &str = "buildings_update";
/// Notification subject carrying one created or changed point of interest.
pub const SUBJECT_BUILDING_UPDATE: &str = "building_update";
/// Notification subject carrying one deleted point of interest.
pub const SUBJECT_BUILDING_DELETE: &str = "building_delete";
/// Notification subject telling an entity it was moved to another group.
pub const SUBJECT_GROUP_MOVE: &str = "group_move";

/// Body of a cell join or leave call.
///
/// `lat`/`lon` are the cell's south-west corner in degrees. `key` is the
/// canonical cell key so the receiver never has to re-floor the floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CellRequest {
    /// Latitude of the cell origin.
    pub lat: f64,
    /// Longitude of the cell origin.
    pub lon: f64,
    /// Canonical cell key.
    pub key: String,
}

impl CellRequest {
    /// Build a request for `cell` whose origin is `origin`.
    pub fn new(cell: Cell, origin: Coordinate) -> Self {
        Self {
            lat: origin.lat,
            lon: origin.lon,
            key: cell.key(),
        }
    }
}

/// Body of a `rpcsendlocation` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct LocationBroadcast {
    /// Latitude of the sender's current cell origin.
    pub lat: f64,
    /// Longitude of the sender's current cell origin.
    pub lon: f64,
    /// Canonical key of the sender's current cell.
    pub key: String,
    /// The sender's exact position.
    pub data: Coordinate,
    /// Name of the sender's group, if it belongs to one.
    pub group: Option<String>,
}

/// A position message received on a cell or group stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StreamMessage {
    /// The entity that sent the position.
    pub user_id: EntityId,
    /// The sender's exact position.
    pub data: Coordinate,
    /// Name of the sender's group, present on group-stream deliveries.
    #[serde(default)]
    pub group: Option<String>,
}

/// Presence change on a stream: entities that joined or left it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PresenceEvent {
    /// Entities that joined the stream.
    #[serde(default)]
    pub joins: Vec<EntityId>,
    /// Entities that left the stream.
    #[serde(default)]
    pub leaves: Vec<EntityId>,
}

/// A point of interest (a building published from the CMS).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PointOfInterest {
    /// CMS post identifier.
    pub id: i64,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Icon image URL.
    #[serde(default)]
    pub image: Option<String>,
    /// Link to the CMS page.
    #[serde(default)]
    pub link: Option<String>,
    /// Display title.
    #[serde(default)]
    pub title: Option<String>,
}

/// Content of a `building_update` or `building_delete` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct BuildingNotice {
    /// The affected point of interest.
    pub data: PointOfInterest,
}

/// A group the entity belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct GroupInfo {
    /// Server-side group identifier.
    pub id: GroupId,
    /// Group name; also the name of the group's broadcast stream.
    pub name: String,
}

/// Content of a `group_move` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct GroupMove {
    /// Group the entity was removed from.
    pub leave: GroupId,
    /// Group the entity was added to.
    pub enter: GroupId,
    /// Name of the group entered, when the server includes it.
    #[serde(default)]
    pub enter_name: Option<String>,
}

/// How a mirrored remote entity relates to the local one.
///
/// Classification only affects presentation, never retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum Classification {
    /// The remote entity is in the same group as the local one.
    SameGroup,
    /// Any other remote entity.
    Other,
}

impl Classification {
    /// Classify a remote sender by comparing its group with ours.
    pub fn of(theirs: Option<&str>, ours: Option<&str>) -> Self {
        match (theirs, ours) {
            (Some(a), Some(b)) if a == b => Self::SameGroup,
            _ => Self::Other,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn stream_message_without_group_parses() {
        let id = EntityId::new();
        let raw = format!(r#"{{"user_id":"{id}","data":{{"lat":1.5,"lon":-2.5}}}}"#);
        let msg: StreamMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(msg.user_id, id);
        assert!(msg.group.is_none());
    }

    #[test]
    fn cell_request_carries_canonical_key() {
        let req = CellRequest::new(Cell::new(18887, -61210), Coordinate::new(37.774, -122.42));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["key"], "18887_-61210");
    }

    #[test]
    fn classification_requires_matching_group_names() {
        assert_eq!(
            Classification::of(Some("AutoGroup_1"), Some("AutoGroup_1")),
            Classification::SameGroup
        );
        assert_eq!(
            Classification::of(Some("AutoGroup_1"), Some("AutoGroup_2")),
            Classification::Other
        );
        assert_eq!(Classification::of(None, None), Classification::Other);
        assert_eq!(Classification::of(Some("AutoGroup_1"), None), Classification::Other);
    }

    #[test]
    fn presence_event_defaults_missing_lists() {
        let event: PresenceEvent = serde_json::from_str("{}").unwrap();
        assert!(event.joins.is_empty());
        assert!(event.leaves.is_empty());
    }
}
