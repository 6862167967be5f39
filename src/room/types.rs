//! Core room/peer/presence data model (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::personality::RoomAiConfig;

/// Opaque 10-char room id.
pub type RoomId = String;

/// Per-connection opaque peer id, not stable across reconnect.
pub type PeerId = Uuid;

/// Room lifecycle status (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    Active,
    Full,
    Closed,
}

/// A peer's role within a room, affecting turn/interrupt priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Owner,
    Moderator,
    Participant,
}

/// WebSocket connection lifecycle (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

/// Per-peer audio presence fields, updated via `presence:update` and
/// debounced by the Presence Tracker (spec.md §4.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPresence {
    pub is_muted: bool,
    pub is_speaking: bool,
    pub is_addressing_ai: bool,
    pub audio_level: f32,
}

impl Default for AudioPresence {
    fn default() -> Self {
        Self {
            is_muted: false,
            is_speaking: false,
            is_addressing_ai: false,
            audio_level: 0.0,
        }
    }
}

impl AudioPresence {
    /// Merge a partial update in, clamping `audio_level` to [0, 1].
    pub fn merge(&mut self, partial: &PresenceUpdate) {
        if let Some(v) = partial.is_muted {
            self.is_muted = v;
        }
        if let Some(v) = partial.is_speaking {
            self.is_speaking = v;
        }
        if let Some(v) = partial.is_addressing_ai {
            self.is_addressing_ai = v;
        }
        if let Some(v) = partial.audio_level {
            self.audio_level = v.clamp(0.0, 1.0);
        }
    }

    /// Field-wise equality used to suppress redundant broadcasts, with an
    /// absolute-threshold comparison on `audio_level` (spec.md §4.3).
    #[must_use]
    pub fn roughly_equals(&self, other: &Self) -> bool {
        self.is_muted == other.is_muted
            && self.is_speaking == other.is_speaking
            && self.is_addressing_ai == other.is_addressing_ai
            && (self.audio_level - other.audio_level).abs() <= 0.05
    }
}

/// Partial presence update from a client (`presence:update`, spec.md §4.2).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub is_muted: Option<bool>,
    pub is_speaking: Option<bool>,
    pub is_addressing_ai: Option<bool>,
    pub audio_level: Option<f32>,
}

/// Full presence record for a peer (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub connection_state: ConnectionState,
    pub audio: AudioPresence,
    pub last_active_at: DateTime<Utc>,
    pub is_idle: bool,
}

impl Presence {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connection_state: ConnectionState::Connected,
            audio: AudioPresence::default(),
            last_active_at: Utc::now(),
            is_idle: false,
        }
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected participant of a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: PeerRole,
    pub room_id: RoomId,
    pub joined_at: DateTime<Utc>,
    pub presence: Presence,
}

/// Lightweight, privacy-stripped view of a room for `List` (spec.md §4.1).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: RoomId,
    pub name: String,
    pub description: Option<String>,
    pub max_participants: u32,
    pub participant_count: u32,
    pub status: RoomStatus,
    pub owner_id: PeerId,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// The authoritative room aggregate (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub description: Option<String>,
    pub max_participants: u32,
    pub status: RoomStatus,
    pub owner_id: PeerId,
    pub ai_config: RoomAiConfig,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub participants: Vec<Peer>,
}

impl Room {
    #[must_use]
    pub fn participant_count(&self) -> u32 {
        self.participants.len() as u32
    }

    #[must_use]
    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            max_participants: self.max_participants,
            participant_count: self.participant_count(),
            status: self.status,
            owner_id: self.owner_id,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }

    #[must_use]
    pub fn get_peer(&self, peer_id: PeerId) -> Option<&Peer> {
        self.participants.iter().find(|p| p.id == peer_id)
    }

    pub fn get_peer_mut(&mut self, peer_id: PeerId) -> Option<&mut Peer> {
        self.participants.iter_mut().find(|p| p.id == peer_id)
    }
}

/// Request to create a room (`POST /rooms`, spec.md §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub name: String,
    pub description: Option<String>,
    pub max_participants: Option<u32>,
    pub ai_personality: Option<crate::personality::Personality>,
    pub voice_settings: Option<String>,
}
