//! Room Store (spec.md §4.1) and core room/peer/presence data model (§3).

pub mod id;
pub mod store;
pub mod types;

pub use store::{ExportSink, RoomHandle, RoomStore};
pub use types::{
    AudioPresence, ConnectionState, CreateRoomRequest, Peer, PeerId, PeerRole, Presence,
    PresenceUpdate, Room, RoomId, RoomStatus, RoomSummary,
};
