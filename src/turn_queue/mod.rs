//! Turn Queue Processor (spec.md §4.4): per-room FIFO-with-priority queue of
//! "address-the-AI" requests.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::room::{PeerId, PeerRole, RoomId};

/// A queued or active "address-the-AI" request (spec.md §3).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub id: Uuid,
    pub peer_id: PeerId,
    pub peer_display_name: String,
    pub room_id: RoomId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// 1-based; 0 means this request is the active turn.
    pub position: u32,
    pub priority: i64,
    #[serde(skip)]
    attempts: u32,
}

/// Notification that a waiting peer's queue position changed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionChange {
    pub request_id: Uuid,
    pub peer_id: PeerId,
    pub position: u32,
}

/// Outcome of `ProcessNext`.
#[derive(Debug, Clone)]
pub enum GrantOutcome {
    Granted(TurnRequest),
    /// Preconditions not met right now (already processing, active turn in
    /// progress, or `min_turn_interval` since the last completion has not
    /// elapsed); caller should retry later.
    Deferred,
    Empty,
}

struct RoomQueue {
    active: Option<TurnRequest>,
    waiting: VecDeque<TurnRequest>,
    processing: bool,
    last_completion: Option<Instant>,
    expired_count: u64,
}

impl RoomQueue {
    fn new() -> Self {
        Self {
            active: None,
            waiting: VecDeque::new(),
            processing: false,
            last_completion: None,
            expired_count: 0,
        }
    }

    fn snapshot_positions(&self) -> HashMap<Uuid, u32> {
        let mut out = HashMap::new();
        if let Some(ref a) = self.active {
            out.insert(a.id, a.position);
        }
        for w in &self.waiting {
            out.insert(w.id, w.position);
        }
        out
    }

    fn recompute_positions(&mut self) {
        if let Some(ref mut a) = self.active {
            a.position = 0;
        }
        for (idx, w) in self.waiting.iter_mut().enumerate() {
            w.position = idx as u32 + 1;
        }
    }

    /// Diff against a prior snapshot; entries that are new or moved are
    /// reported, entries that vanished (granted/cancelled/expired) are not
    /// (those are reported through their own dedicated outcome).
    fn diff_positions(&self, before: &HashMap<Uuid, u32>) -> Vec<PositionChange> {
        let mut out = Vec::new();
        for w in &self.waiting {
            if before.get(&w.id) != Some(&w.position) {
                out.push(PositionChange {
                    request_id: w.id,
                    peer_id: w.peer_id,
                    position: w.position,
                });
            }
        }
        out
    }
}

/// Result of a mutation: the primary outcome plus any position-change
/// notifications callers should broadcast to the room.
#[derive(Debug, Clone)]
pub struct Mutation<T> {
    pub value: T,
    pub position_changes: Vec<PositionChange>,
}

/// Process-wide turn-queue registry, one [`RoomQueue`] lazily created per room.
pub struct TurnQueueProcessor {
    rooms: DashMap<RoomId, Mutex<RoomQueue>>,
    max_queue_size: usize,
    default_timeout: Duration,
    priority_timeout: Duration,
    priority_bonus: i64,
    min_turn_interval: Duration,
    max_processing_attempts: u32,
}

impl TurnQueueProcessor {
    #[must_use]
    pub fn new(
        max_queue_size: usize,
        default_timeout: Duration,
        priority_timeout: Duration,
        priority_bonus: i64,
        min_turn_interval: Duration,
        max_processing_attempts: u32,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            max_queue_size,
            default_timeout,
            priority_timeout,
            priority_bonus,
            min_turn_interval,
            max_processing_attempts,
        }
    }

    /// `Enqueue(roomId, peerId, name, role, priority)` (spec.md §4.4). Returns
    /// `None` when the room's waiting list is already at capacity.
    pub async fn enqueue(
        &self,
        room_id: &str,
        peer_id: PeerId,
        peer_display_name: String,
        role: PeerRole,
    ) -> Option<Mutation<TurnRequest>> {
        let entry = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Mutex::new(RoomQueue::new()));
        let mut q = entry.lock().await;

        if q.waiting.len() >= self.max_queue_size {
            return None;
        }

        let priority_role = matches!(role, PeerRole::Owner | PeerRole::Moderator);
        let priority = if priority_role { self.priority_bonus } else { 0 };
        let timeout = if priority_role {
            self.priority_timeout
        } else {
            self.default_timeout
        };

        let now = Utc::now();
        let request = TurnRequest {
            id: Uuid::new_v4(),
            peer_id,
            peer_display_name,
            room_id: room_id.to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(timeout).unwrap_or_default(),
            position: 0,
            priority,
            attempts: 0,
        };

        let before = q.snapshot_positions();
        // Find the first existing entry with strictly lower priority; insert
        // before it; otherwise append (FIFO within equal priority).
        let insert_at = q
            .waiting
            .iter()
            .position(|existing| existing.priority < request.priority)
            .unwrap_or(q.waiting.len());
        q.waiting.insert(insert_at, request.clone());
        q.recompute_positions();
        let position_changes = q.diff_positions(&before);

        debug!(room_id, peer_id = %peer_id, priority, "turn request enqueued");
        Some(Mutation {
            value: q.waiting.iter().find(|w| w.id == request.id).cloned().unwrap_or(request),
            position_changes,
        })
    }

    /// `Cancel(roomId, requestId)`.
    pub async fn cancel(&self, room_id: &str, request_id: Uuid) -> Mutation<bool> {
        let Some(entry) = self.rooms.get(room_id) else {
            return Mutation { value: false, position_changes: Vec::new() };
        };
        let mut q = entry.lock().await;
        let before = q.snapshot_positions();
        let before_len = q.waiting.len();
        q.waiting.retain(|w| w.id != request_id);
        let removed = q.waiting.len() != before_len;
        q.recompute_positions();
        let position_changes = if removed { q.diff_positions(&before) } else { Vec::new() };
        Mutation { value: removed, position_changes }
    }

    /// `CancelAllForPeer(roomId, peerId)`. Does not touch an active turn
    /// owned by this peer; callers use `EndTurn` for that.
    pub async fn cancel_all_for_peer(&self, room_id: &str, peer_id: PeerId) -> Mutation<usize> {
        let Some(entry) = self.rooms.get(room_id) else {
            return Mutation { value: 0, position_changes: Vec::new() };
        };
        let mut q = entry.lock().await;
        let before = q.snapshot_positions();
        let before_len = q.waiting.len();
        q.waiting.retain(|w| w.peer_id != peer_id);
        let removed = before_len - q.waiting.len();
        q.recompute_positions();
        let position_changes = if removed > 0 { q.diff_positions(&before) } else { Vec::new() };
        Mutation { value: removed, position_changes }
    }

    /// `BumpToFront(roomId, requestId)`.
    pub async fn bump_to_front(&self, room_id: &str, request_id: Uuid) -> Mutation<bool> {
        let Some(entry) = self.rooms.get(room_id) else {
            return Mutation { value: false, position_changes: Vec::new() };
        };
        let mut q = entry.lock().await;
        let before = q.snapshot_positions();
        let Some(idx) = q.waiting.iter().position(|w| w.id == request_id) else {
            return Mutation { value: false, position_changes: Vec::new() };
        };
        let req = q.waiting.remove(idx).expect("index just located");
        q.waiting.push_front(req);
        q.recompute_positions();
        let position_changes = q.diff_positions(&before);
        Mutation { value: true, position_changes }
    }

    /// `ProcessNext(roomId)`.
    pub async fn process_next(&self, room_id: &str) -> Mutation<GrantOutcome> {
        let Some(entry) = self.rooms.get(room_id) else {
            return Mutation { value: GrantOutcome::Empty, position_changes: Vec::new() };
        };
        let mut q = entry.lock().await;

        if q.processing || q.active.is_some() {
            return Mutation { value: GrantOutcome::Deferred, position_changes: Vec::new() };
        }
        if let Some(last) = q.last_completion {
            if last.elapsed() < self.min_turn_interval {
                return Mutation { value: GrantOutcome::Deferred, position_changes: Vec::new() };
            }
        }

        let before = q.snapshot_positions();
        let now = Utc::now();
        loop {
            let Some(mut head) = q.waiting.pop_front() else {
                q.recompute_positions();
                let position_changes = q.diff_positions(&before);
                return Mutation { value: GrantOutcome::Empty, position_changes };
            };
            if head.expires_at <= now {
                q.expired_count += 1;
                continue;
            }
            head.attempts += 1;
            if head.attempts > self.max_processing_attempts {
                debug!(room_id, request_id = %head.id, "dropped: max processing attempts exceeded");
                continue;
            }
            head.position = 0;
            q.processing = true;
            q.active = Some(head.clone());
            q.recompute_positions();
            let position_changes = q.diff_positions(&before);
            return Mutation { value: GrantOutcome::Granted(head), position_changes };
        }
    }

    /// `OnResponseDone(roomId)`: ends the current turn and, when
    /// `auto_advance` is set, immediately attempts to grant the next one.
    pub async fn on_response_done(&self, room_id: &str, auto_advance: bool) -> Option<Mutation<GrantOutcome>> {
        if let Some(entry) = self.rooms.get(room_id) {
            let mut q = entry.lock().await;
            q.active = None;
            q.processing = false;
            q.last_completion = Some(Instant::now());
        }
        if auto_advance {
            Some(self.process_next(room_id).await)
        } else {
            None
        }
    }

    /// `EndTurn(roomId, wasInterrupted)`: force-clears the active turn
    /// (used by the Interrupt Handler); does not auto-advance.
    pub async fn end_turn(&self, room_id: &str, was_interrupted: bool) {
        if let Some(entry) = self.rooms.get(room_id) {
            let mut q = entry.lock().await;
            q.active = None;
            q.processing = false;
            q.last_completion = Some(Instant::now());
            if was_interrupted {
                debug!(room_id, "turn ended by interrupt");
            }
        }
    }

    /// Current queue snapshot for a room's `RoomAIState.queue` field.
    pub async fn snapshot(&self, room_id: &str) -> Vec<TurnRequest> {
        let Some(entry) = self.rooms.get(room_id) else {
            return Vec::new();
        };
        let q = entry.lock().await;
        let mut out = Vec::new();
        if let Some(ref a) = q.active {
            out.push(a.clone());
        }
        out.extend(q.waiting.iter().cloned());
        out
    }

    pub fn remove_room(&self, room_id: &str) {
        self.rooms.remove(room_id);
    }

    /// Cooldown window a [`GrantOutcome::Deferred`] caused by
    /// `min_turn_interval` will clear within; callers that get `Deferred`
    /// back and have no other event to hang a retry off of should wait at
    /// least this long before calling [`Self::process_next`] again.
    #[must_use]
    pub fn min_turn_interval(&self) -> Duration {
        self.min_turn_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> TurnQueueProcessor {
        TurnQueueProcessor::new(
            20,
            Duration::from_secs(30),
            Duration::from_secs(60),
            100,
            Duration::from_millis(500),
            3,
        )
    }

    #[tokio::test]
    async fn priority_requests_jump_ahead_of_plain_fifo() {
        let p = processor();
        let room = "room1";
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();

        p.enqueue(room, alice, "Alice".into(), PeerRole::Participant).await.unwrap();
        p.enqueue(room, bob, "Bob".into(), PeerRole::Participant).await.unwrap();
        let mutation = p.enqueue(room, carol, "Carol".into(), PeerRole::Owner).await.unwrap();
        assert_eq!(mutation.value.position, 1);

        let snapshot = p.snapshot(room).await;
        assert_eq!(snapshot[0].peer_id, carol);
        assert_eq!(snapshot[1].peer_id, alice);
        assert_eq!(snapshot[2].peer_id, bob);
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let p = processor();
        let room = "room2";
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        p.enqueue(room, alice, "Alice".into(), PeerRole::Participant).await.unwrap();
        p.enqueue(room, bob, "Bob".into(), PeerRole::Participant).await.unwrap();
        let snapshot = p.snapshot(room).await;
        assert_eq!(snapshot[0].peer_id, alice);
        assert_eq!(snapshot[1].peer_id, bob);
    }

    #[tokio::test]
    async fn only_one_active_turn_at_a_time() {
        let p = processor();
        let room = "room3";
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        p.enqueue(room, alice, "Alice".into(), PeerRole::Participant).await.unwrap();
        p.enqueue(room, bob, "Bob".into(), PeerRole::Participant).await.unwrap();

        let outcome = p.process_next(room).await.value;
        assert!(matches!(outcome, GrantOutcome::Granted(ref r) if r.peer_id == alice));

        // Second peer cannot be granted while the first turn is active.
        let outcome = p.process_next(room).await.value;
        assert!(matches!(outcome, GrantOutcome::Deferred));
    }

    #[tokio::test]
    async fn min_turn_interval_defers_grant_after_completion() {
        let p = processor();
        let room = "room4";
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        p.enqueue(room, alice, "Alice".into(), PeerRole::Participant).await.unwrap();
        p.process_next(room).await;
        p.on_response_done(room, false).await;

        p.enqueue(room, bob, "Bob".into(), PeerRole::Participant).await.unwrap();
        let outcome = p.process_next(room).await.value;
        assert!(matches!(outcome, GrantOutcome::Deferred));
    }

    #[tokio::test]
    async fn queue_rejects_beyond_max_size() {
        let p = TurnQueueProcessor::new(
            1,
            Duration::from_secs(30),
            Duration::from_secs(60),
            100,
            Duration::from_millis(0),
            3,
        );
        let room = "room5";
        p.enqueue(room, Uuid::new_v4(), "A".into(), PeerRole::Participant).await.unwrap();
        let second = p.enqueue(room, Uuid::new_v4(), "B".into(), PeerRole::Participant).await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn cancel_all_for_peer_removes_only_their_requests() {
        let p = processor();
        let room = "room6";
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        p.enqueue(room, alice, "Alice".into(), PeerRole::Participant).await.unwrap();
        p.enqueue(room, alice, "Alice again".into(), PeerRole::Participant).await.unwrap();
        p.enqueue(room, bob, "Bob".into(), PeerRole::Participant).await.unwrap();

        let removed = p.cancel_all_for_peer(room, alice).await.value;
        assert_eq!(removed, 2);
        let snapshot = p.snapshot(room).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].peer_id, bob);
    }
}
