//! Room Store (spec.md §4.1): authoritative map of rooms, participants, status.
//!
//! Each room's mutable aggregate is guarded by its own `tokio::sync::RwLock`
//! (the "per-room write lock" of spec.md §4.1); the store itself is a
//! lock-free map from room id to room handle, mirroring the teacher's
//! `SfuServer { rooms: Arc<RwLock<HashMap<..>>> }` but using `DashMap` so
//! concurrent rooms never contend on each other's lookups.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::AppError;
use crate::personality::RoomAiConfig;
use crate::room::id;
use crate::room::types::{CreateRoomRequest, Peer, Room, RoomId, RoomStatus, RoomSummary};

/// A room together with the lock that serializes its mutation.
pub struct RoomHandle {
    pub id: RoomId,
    inner: RwLock<Room>,
}

impl RoomHandle {
    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, Room> {
        self.inner.read().await
    }

    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, Room> {
        self.inner.write().await
    }
}

/// Optional hook invoked with a room's final (participant-stripped) state
/// and transcript on close, in lieu of durable persistence (spec.md §6).
#[async_trait::async_trait]
pub trait ExportSink: Send + Sync {
    async fn export(&self, summary: RoomSummary, transcript_json: serde_json::Value);
}

/// Process-wide room registry.
pub struct RoomStore {
    rooms: DashMap<RoomId, Arc<RoomHandle>>,
    min_max_participants: u32,
    max_max_participants: u32,
    default_max_participants: u32,
}

impl RoomStore {
    #[must_use]
    pub fn new(min_max_participants: u32, max_max_participants: u32, default_max_participants: u32) -> Self {
        Self {
            rooms: DashMap::new(),
            min_max_participants,
            max_max_participants,
            default_max_participants,
        }
    }

    /// Create a new room, generating a collision-checked id.
    pub fn create(&self, req: CreateRoomRequest, owner_id: uuid::Uuid) -> Result<Arc<RoomHandle>, AppError> {
        let max_participants = req
            .max_participants
            .unwrap_or(self.default_max_participants)
            .clamp(self.min_max_participants, self.max_max_participants);

        let ai_config = RoomAiConfig::new(req.ai_personality.unwrap_or_default(), req.voice_settings)
            .map_err(AppError::InvalidInput)?;

        let mut room_id = id::generate();
        while self.rooms.contains_key(&room_id) {
            room_id = id::generate();
        }

        let now = Utc::now();
        let room = Room {
            id: room_id.clone(),
            name: req.name,
            description: req.description,
            max_participants,
            status: RoomStatus::Waiting,
            owner_id,
            ai_config,
            created_at: now,
            last_activity_at: now,
            participants: Vec::new(),
        };

        let handle = Arc::new(RoomHandle {
            id: room_id.clone(),
            inner: RwLock::new(room),
        });
        self.rooms.insert(room_id.clone(), handle.clone());
        debug!(room_id = %room_id, "room created");
        Ok(handle)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<RoomHandle>> {
        self.rooms.get(id).map(|r| r.clone())
    }

    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.rooms.contains_key(id)
    }

    /// Strips participant lists for privacy (spec.md §4.1).
    pub async fn list(&self, status: Option<RoomStatus>) -> Vec<RoomSummary> {
        let mut out = Vec::new();
        for entry in self.rooms.iter() {
            let room = entry.value().read().await;
            if status.is_none_or(|s| s == room.status) {
                out.push(room.summary());
            }
        }
        out
    }

    /// Add a participant, enforcing capacity/closed invariants and the
    /// waiting→active and active→full status transitions.
    pub async fn add_participant(&self, room_id: &str, peer: Peer) -> Result<RoomSummary, AppError> {
        let handle = self.get(room_id).ok_or(AppError::RoomNotFound)?;
        let mut room = handle.write().await;

        if room.status == RoomStatus::Closed {
            return Err(AppError::RoomClosed);
        }
        if room.participant_count() >= room.max_participants {
            return Err(AppError::RoomFull);
        }

        room.participants.push(peer);
        room.last_activity_at = Utc::now();

        room.status = if room.participant_count() >= room.max_participants {
            RoomStatus::Full
        } else {
            RoomStatus::Active
        };

        Ok(room.summary())
    }

    /// Idempotent for unknown peers; transitions full→active.
    pub async fn remove_participant(&self, room_id: &str, peer_id: uuid::Uuid) -> Option<RoomSummary> {
        let handle = self.get(room_id)?;
        let mut room = handle.write().await;

        let before = room.participants.len();
        room.participants.retain(|p| p.id != peer_id);
        if room.participants.len() != before {
            room.last_activity_at = Utc::now();
            if room.status == RoomStatus::Full {
                room.status = RoomStatus::Active;
            }
        }
        Some(room.summary())
    }

    /// Explicit status update; a closed room never re-opens.
    pub async fn update_status(&self, room_id: &str, status: RoomStatus) -> Result<(), AppError> {
        let handle = self.get(room_id).ok_or(AppError::RoomNotFound)?;
        let mut room = handle.write().await;
        if room.status == RoomStatus::Closed {
            return Err(AppError::RoomClosed);
        }
        room.status = status;
        Ok(())
    }

    /// Close a room: terminal, irreversible. The room stays resident (in
    /// `Closed` status, with presence cleared) so in-flight admission
    /// checks still observe it as closed rather than not-found; a
    /// separate sweep ([`Self::reap_closed`]) evicts it later.
    pub async fn close(&self, room_id: &str) -> Result<Arc<RoomHandle>, AppError> {
        let handle = self.get(room_id).ok_or(AppError::RoomNotFound)?;
        {
            let mut room = handle.write().await;
            room.status = RoomStatus::Closed;
            room.participants.clear();
        }
        debug!(room_id = %room_id, "room closed");
        Ok(handle)
    }

    /// Evict rooms that have been closed (hence empty) for at least
    /// `idle_after`, freeing the registry entry for good.
    pub async fn reap_closed(&self, idle_after: chrono::Duration) {
        let cutoff = Utc::now() - idle_after;
        let mut to_remove = Vec::new();
        for entry in self.rooms.iter() {
            let room = entry.value().read().await;
            if room.status == RoomStatus::Closed && room.last_activity_at < cutoff {
                to_remove.push(room.id.clone());
            }
        }
        for id in to_remove {
            self.rooms.remove(&id);
        }
    }

    /// Rooms with no peers and no activity for at least `idle_after`
    /// (idle sweep, spec.md §3 lifecycle summary) — candidates for `Close`.
    pub async fn idle_room_ids(&self, idle_after: chrono::Duration) -> Vec<RoomId> {
        let cutoff = Utc::now() - idle_after;
        let mut out = Vec::new();
        for entry in self.rooms.iter() {
            let room = entry.value().read().await;
            if room.status != RoomStatus::Closed
                && room.participants.is_empty()
                && room.last_activity_at < cutoff
            {
                out.push(room.id.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::types::{ConnectionState, Peer, PeerRole, Presence};

    fn store() -> RoomStore {
        RoomStore::new(2, 10, 6)
    }

    fn mk_peer(role: PeerRole) -> Peer {
        Peer {
            id: uuid::Uuid::new_v4(),
            display_name: "Alice".into(),
            avatar_url: None,
            role,
            room_id: String::new(),
            joined_at: Utc::now(),
            presence: Presence {
                connection_state: ConnectionState::Connected,
                ..Presence::new()
            },
        }
    }

    #[tokio::test]
    async fn capacity_enforced_and_status_transitions() {
        let store = store();
        let owner = uuid::Uuid::new_v4();
        let handle = store
            .create(
                CreateRoomRequest {
                    name: "Y".into(),
                    description: None,
                    max_participants: Some(2),
                    ai_personality: None,
                    voice_settings: None,
                },
                owner,
            )
            .unwrap();

        let p1 = mk_peer(PeerRole::Owner);
        let p2 = mk_peer(PeerRole::Participant);
        let p3 = mk_peer(PeerRole::Participant);

        store.add_participant(&handle.id, p1).await.unwrap();
        let summary = store.add_participant(&handle.id, p2).await.unwrap();
        assert_eq!(summary.status, RoomStatus::Full);

        let err = store.add_participant(&handle.id, p3).await.unwrap_err();
        assert!(matches!(err, AppError::RoomFull));
    }

    #[tokio::test]
    async fn closed_room_rejects_joins_and_never_reopens() {
        let store = store();
        let owner = uuid::Uuid::new_v4();
        let handle = store
            .create(
                CreateRoomRequest {
                    name: "Z".into(),
                    description: None,
                    max_participants: None,
                    ai_personality: None,
                    voice_settings: None,
                },
                owner,
            )
            .unwrap();
        store.close(&handle.id).await.unwrap();

        let err = store.add_participant(&handle.id, mk_peer(PeerRole::Participant)).await.unwrap_err();
        assert!(matches!(err, AppError::RoomClosed));
    }

    #[tokio::test]
    async fn remove_participant_is_idempotent_for_unknown_peers() {
        let store = store();
        let owner = uuid::Uuid::new_v4();
        let handle = store
            .create(
                CreateRoomRequest {
                    name: "W".into(),
                    description: None,
                    max_participants: None,
                    ai_personality: None,
                    voice_settings: None,
                },
                owner,
            )
            .unwrap();

        // Unknown peer removal does not error and does not panic.
        let summary = store.remove_participant(&handle.id, uuid::Uuid::new_v4()).await;
        assert!(summary.is_some());
    }
}
