//! Interrupt Handler (spec.md §4.7): urgent-override requests that cancel
//! an in-flight AI response.
//!
//! Talks to the AI Orchestrator only through the [`Interrupter`] capability
//! interface, the same injected-capability pattern used for [`crate::ai::Broadcaster`]
//! and [`crate::ai::FunctionCallHandler`] — this module never owns or
//! constructs an `AiOrchestrator` directly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::room::{PeerId, PeerRole, RoomId, RoomStore};

/// Capability the Interrupt Handler needs from the AI Orchestrator: cancel
/// whatever response is in flight for a room, reporting whether one
/// actually was.
#[async_trait::async_trait]
pub trait Interrupter: Send + Sync {
    async fn interrupt(&self, room_id: &str) -> bool;
}

/// Why `CanInterrupt` denied a request (spec.md §4.7 rule chain, evaluated
/// in order, first failure wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    RoomNotFound,
    Disabled,
    RoleNotPermitted,
    Cooldown,
    RateLimited,
}

/// Lifecycle event recorded in a room's interrupt history.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InterruptEvent {
    Requested { request_id: Uuid, peer_id: PeerId, at: DateTime<Utc> },
    Processed { request_id: Uuid, peer_id: PeerId, at: DateTime<Utc> },
    Rejected { request_id: Uuid, peer_id: PeerId, reason: String, at: DateTime<Utc> },
    Cancelled { request_id: Uuid, peer_id: PeerId, at: DateTime<Utc> },
}

struct PendingRequest {
    peer_id: PeerId,
}

struct RoomInterruptState {
    last_interrupt_at: Option<Instant>,
    window_start: Instant,
    count_this_minute: u32,
    pending: HashMap<Uuid, PendingRequest>,
    history: Vec<InterruptEvent>,
}

impl RoomInterruptState {
    fn new() -> Self {
        Self {
            last_interrupt_at: None,
            window_start: Instant::now(),
            count_this_minute: 0,
            pending: HashMap::new(),
            history: Vec::new(),
        }
    }

    fn push_history(&mut self, event: InterruptEvent) {
        self.history.push(event);
        if self.history.len() > 100 {
            let keep_from = self.history.len() - 50;
            self.history.drain(..keep_from);
        }
    }

    /// Resets the per-minute counter on a wall-clock minute boundary
    /// relative to the last reset, not a fixed calendar minute.
    fn maybe_reset_window(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= Duration::from_secs(60) {
            self.window_start = now;
            self.count_this_minute = 0;
        }
    }
}

/// Config knobs from spec.md §4.7.
#[derive(Debug, Clone)]
pub struct InterruptConfig {
    pub enabled: bool,
    pub owner_only: bool,
    pub moderators_can_interrupt: bool,
    pub cooldown: Duration,
    pub max_per_minute: u32,
    pub log_all_events: bool,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            owner_only: false,
            moderators_can_interrupt: true,
            cooldown: Duration::from_millis(2000),
            max_per_minute: 10,
            log_all_events: false,
        }
    }
}

/// Process-wide interrupt registry, one [`RoomInterruptState`] per room.
pub struct InterruptHandler {
    rooms: DashMap<RoomId, Mutex<RoomInterruptState>>,
    room_store: std::sync::Arc<RoomStore>,
    config: InterruptConfig,
}

impl InterruptHandler {
    #[must_use]
    pub fn new(room_store: std::sync::Arc<RoomStore>, config: InterruptConfig) -> Self {
        Self { rooms: DashMap::new(), room_store, config }
    }

    fn role_permitted(&self, role: PeerRole) -> bool {
        match role {
            PeerRole::Owner => true,
            PeerRole::Moderator => !self.config.owner_only && self.config.moderators_can_interrupt,
            PeerRole::Participant => !self.config.owner_only,
        }
    }

    /// `CanInterrupt(roomId, peerId, role)`.
    pub async fn can_interrupt(&self, room_id: &str, role: PeerRole) -> Result<(), DenyReason> {
        if !self.room_store.exists(room_id) {
            return Err(DenyReason::RoomNotFound);
        }
        if !self.config.enabled {
            return Err(DenyReason::Disabled);
        }
        if !self.role_permitted(role) {
            return Err(DenyReason::RoleNotPermitted);
        }

        let now = Instant::now();
        let state = self.rooms.entry(room_id.to_string()).or_insert_with(|| Mutex::new(RoomInterruptState::new()));
        let mut st = state.lock().await;
        if let Some(last) = st.last_interrupt_at {
            if now.duration_since(last) < self.config.cooldown {
                return Err(DenyReason::Cooldown);
            }
        }
        st.maybe_reset_window(now);
        if st.count_this_minute >= self.config.max_per_minute {
            return Err(DenyReason::RateLimited);
        }
        Ok(())
    }

    /// `RequestInterrupt`: creates a pending record after `CanInterrupt`
    /// passes, returning the new request id.
    pub async fn request_interrupt(
        &self,
        room_id: &str,
        peer_id: PeerId,
        role: PeerRole,
    ) -> Result<Uuid, DenyReason> {
        self.can_interrupt(room_id, role).await?;

        let request_id = Uuid::new_v4();
        let state = self.rooms.entry(room_id.to_string()).or_insert_with(|| Mutex::new(RoomInterruptState::new()));
        let mut st = state.lock().await;
        st.pending.insert(request_id, PendingRequest { peer_id });
        st.push_history(InterruptEvent::Requested { request_id, peer_id, at: Utc::now() });
        if self.config.log_all_events {
            info!(room_id, %request_id, %peer_id, "interrupt requested");
        }
        Ok(request_id)
    }

    /// `ProcessInterrupt(requestId, ...)`: cancels the in-flight response via
    /// the injected [`Interrupter`], then clears/unlocks on success. Any
    /// panic-worthy failure from the interrupter is caught at the call site
    /// by `interrupter.interrupt` returning `false` rather than erroring —
    /// callers that wrap a fallible cancel should translate errors to `false`
    /// before calling this.
    pub async fn process_interrupt(
        &self,
        room_id: &str,
        request_id: Uuid,
        interrupter: &dyn Interrupter,
    ) -> bool {
        let Some(state) = self.rooms.get(room_id) else {
            warn!(room_id, %request_id, "process_interrupt on unknown room");
            return false;
        };

        let peer_id = {
            let st = state.lock().await;
            match st.pending.get(&request_id) {
                Some(p) => p.peer_id,
                None => {
                    warn!(room_id, %request_id, "process_interrupt on unknown request");
                    return false;
                }
            }
        };

        let success = interrupter.interrupt(room_id).await;

        let mut st = state.lock().await;
        st.pending.remove(&request_id);
        if success {
            st.last_interrupt_at = Some(Instant::now());
            st.count_this_minute += 1;
            st.push_history(InterruptEvent::Processed { request_id, peer_id, at: Utc::now() });
        } else {
            st.push_history(InterruptEvent::Rejected {
                request_id,
                peer_id,
                reason: "no in-flight response to cancel".into(),
                at: Utc::now(),
            });
        }
        success
    }

    /// Cancels a still-pending request without attempting a cancel call.
    pub async fn cancel_request(&self, room_id: &str, request_id: Uuid) {
        let Some(state) = self.rooms.get(room_id) else { return };
        let mut st = state.lock().await;
        if let Some(p) = st.pending.remove(&request_id) {
            st.push_history(InterruptEvent::Cancelled { request_id, peer_id: p.peer_id, at: Utc::now() });
        }
    }

    pub async fn history(&self, room_id: &str) -> Vec<InterruptEvent> {
        let Some(state) = self.rooms.get(room_id) else { return Vec::new() };
        state.lock().await.history.clone()
    }

    pub fn remove_room(&self, room_id: &str) {
        self.rooms.remove(room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::CreateRoomRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingInterrupter {
        calls: AtomicUsize,
        answer: bool,
    }

    #[async_trait::async_trait]
    impl Interrupter for CountingInterrupter {
        async fn interrupt(&self, _room_id: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn store_with_room() -> (Arc<RoomStore>, RoomId) {
        let store = Arc::new(RoomStore::new(2, 10, 6));
        let handle = store
            .create(
                CreateRoomRequest {
                    name: "R".into(),
                    description: None,
                    max_participants: None,
                    ai_personality: None,
                    voice_settings: None,
                },
                Uuid::new_v4(),
            )
            .unwrap();
        (store, handle.id.clone())
    }

    #[tokio::test]
    async fn unknown_room_is_denied() {
        let store = Arc::new(RoomStore::new(2, 10, 6));
        let handler = InterruptHandler::new(store, InterruptConfig::default());
        let err = handler.can_interrupt("nope", PeerRole::Owner).await.unwrap_err();
        assert_eq!(err, DenyReason::RoomNotFound);
    }

    #[tokio::test]
    async fn participant_denied_when_owner_only() {
        let (store, room_id) = store_with_room();
        let mut cfg = InterruptConfig::default();
        cfg.owner_only = true;
        let handler = InterruptHandler::new(store, cfg);
        let err = handler.can_interrupt(&room_id, PeerRole::Participant).await.unwrap_err();
        assert_eq!(err, DenyReason::RoleNotPermitted);
    }

    #[tokio::test]
    async fn cooldown_blocks_back_to_back_requests() {
        let (store, room_id) = store_with_room();
        let mut cfg = InterruptConfig::default();
        cfg.cooldown = Duration::from_secs(60);
        let handler = InterruptHandler::new(store, cfg);
        let interrupter = CountingInterrupter { calls: AtomicUsize::new(0), answer: true };

        let req1 = handler.request_interrupt(&room_id, Uuid::new_v4(), PeerRole::Owner).await.unwrap();
        assert!(handler.process_interrupt(&room_id, req1, &interrupter).await);

        let err = handler.can_interrupt(&room_id, PeerRole::Owner).await.unwrap_err();
        assert_eq!(err, DenyReason::Cooldown);
        assert_eq!(interrupter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_trips_after_max_per_minute() {
        let (store, room_id) = store_with_room();
        let mut cfg = InterruptConfig::default();
        cfg.cooldown = Duration::from_millis(0);
        cfg.max_per_minute = 2;
        let handler = InterruptHandler::new(store, cfg);
        let interrupter = CountingInterrupter { calls: AtomicUsize::new(0), answer: true };

        for _ in 0..2 {
            let req = handler.request_interrupt(&room_id, Uuid::new_v4(), PeerRole::Owner).await.unwrap();
            assert!(handler.process_interrupt(&room_id, req, &interrupter).await);
        }
        let err = handler.can_interrupt(&room_id, PeerRole::Owner).await.unwrap_err();
        assert_eq!(err, DenyReason::RateLimited);
    }

    #[tokio::test]
    async fn failed_cancel_logs_rejected_and_does_not_arm_cooldown() {
        let (store, room_id) = store_with_room();
        let handler = InterruptHandler::new(store, InterruptConfig::default());
        let interrupter = CountingInterrupter { calls: AtomicUsize::new(0), answer: false };

        let req = handler.request_interrupt(&room_id, Uuid::new_v4(), PeerRole::Owner).await.unwrap();
        assert!(!handler.process_interrupt(&room_id, req, &interrupter).await);

        // No cooldown armed on failure, so a second request should pass `CanInterrupt`.
        assert!(handler.can_interrupt(&room_id, PeerRole::Owner).await.is_ok());

        let history = handler.history(&room_id).await;
        assert!(matches!(history.last(), Some(InterruptEvent::Rejected { .. })));
    }

    #[tokio::test]
    async fn history_trims_to_last_fifty_past_hundred() {
        let (store, room_id) = store_with_room();
        let mut cfg = InterruptConfig::default();
        cfg.cooldown = Duration::from_millis(0);
        cfg.max_per_minute = 10_000;
        let handler = InterruptHandler::new(store, cfg);

        for _ in 0..120 {
            handler.cancel_request(&room_id, Uuid::new_v4()).await;
        }
        // cancel_request on unknown ids is a no-op (nothing pending), so
        // drive history growth through request/process instead.
        let interrupter = CountingInterrupter { calls: AtomicUsize::new(0), answer: true };
        for _ in 0..120 {
            let req = handler.request_interrupt(&room_id, Uuid::new_v4(), PeerRole::Owner).await.unwrap();
            handler.process_interrupt(&room_id, req, &interrupter).await;
        }
        let history = handler.history(&room_id).await;
        assert!(history.len() <= 50);
    }
}
