//! Signaling Hub (spec.md §4.2): persistent per-peer WebSocket connections,
//! typed message routing, room join/leave, and SDP/ICE relay.
//!
//! Implements [`crate::ai::Broadcaster`] and
//! [`crate::presence::PresenceBroadcaster`] so the AI Orchestrator and
//! Presence Tracker can reach every connected peer without holding this
//! module directly — the same injected-capability pattern used throughout.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ai::{AiOrchestrator, Broadcaster};
use crate::ai::state::RoomAiState;
use crate::audio::MixedAudioInput;
use crate::interrupt::InterruptHandler;
use crate::personality::RoomAiConfig;
use crate::presence::{PresenceBroadcaster, PresenceTracker};
use crate::provider::SessionConfig;
use crate::room::{Peer, PeerId, PeerRole, Presence, PresenceUpdate, Room, RoomId, RoomStatus, RoomStore, RoomSummary};
use crate::transcript::ContextManager;
use crate::turn_queue::{GrantOutcome, TurnQueueProcessor};

/// Inbound client→server events (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    RoomJoin { room_id: RoomId, display_name: String, avatar_url: Option<String> },
    RoomLeave { room_id: RoomId },
    DisplayNameUpdate { name: String },
    PresenceUpdate(PresenceUpdate),
    PresenceHeartbeat,
    SignalOffer { target_peer_id: PeerId, sdp: String },
    SignalAnswer { target_peer_id: PeerId, sdp: String },
    SignalIce { target_peer_id: PeerId, candidate: String },
    AiPttStart { room_id: RoomId },
    AiPttEnd { room_id: RoomId },
    AiAudioData { room_id: RoomId, audio: String },
    AiInterrupt { room_id: RoomId, source: String },
    TranscriptRequestHistory { room_id: RoomId, limit: usize, before_id: Option<Uuid>, include_summaries: bool },
    SearchClear,
}

/// Outbound server→client events (spec.md §6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomJoined { room: Room, local_peer: Peer, peers: Vec<Peer>, ai_state: RoomAiState },
    RoomLeft { room_id: RoomId },
    RoomError { code: String, message: String, room_id: Option<RoomId> },
    RoomClosed { room_id: RoomId },
    RoomUpdated { summary: RoomSummary },
    PeerJoined { peer: Peer },
    PeerLeft { peer_id: PeerId },
    PeerUpdated { peer: Peer },
    PresenceUpdate { peer_id: PeerId, presence: Presence },
    PresenceSync { peers: Vec<(PeerId, Presence)> },
    AudioLevels { active_speaker: Option<PeerId> },
    SignalOffer { from_peer_id: PeerId, sdp: String },
    SignalAnswer { from_peer_id: PeerId, sdp: String },
    SignalIce { from_peer_id: PeerId, candidate: String },
    AiState(RoomAiState),
    AiAudio { pcm_base64: String },
    TranscriptHistory { entries: serde_json::Value },
    InterruptDenied { reason: String },
}

struct Connection {
    peer_id: PeerId,
    sender: mpsc::Sender<ServerEvent>,
}

/// Process-wide registry of connected peers per room, plus the downstream
/// components a connection handler dispatches into.
pub struct SignalingHub {
    connections: DashMap<RoomId, DashMap<PeerId, Connection>>,
    pub room_store: Arc<RoomStore>,
    pub presence: Arc<PresenceTracker>,
    pub turn_queue: Arc<TurnQueueProcessor>,
    pub ai: Arc<AiOrchestrator>,
    pub interrupt: Arc<InterruptHandler>,
    pub context: Arc<ContextManager>,
    audio: StdMutex<MixedAudioInput>,
    audio_input_sample_rate: u32,
    join_name_min: usize,
    join_name_max: usize,
}

impl SignalingHub {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        room_store: Arc<RoomStore>,
        presence: Arc<PresenceTracker>,
        turn_queue: Arc<TurnQueueProcessor>,
        ai: Arc<AiOrchestrator>,
        interrupt: Arc<InterruptHandler>,
        context: Arc<ContextManager>,
        audio: MixedAudioInput,
        audio_input_sample_rate: u32,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            room_store,
            presence,
            turn_queue,
            ai,
            interrupt,
            context,
            audio: StdMutex::new(audio),
            audio_input_sample_rate,
            join_name_min: 1,
            join_name_max: 40,
        }
    }

    /// Builds the provider `SessionConfig` from the room's live
    /// [`RoomAiConfig`] (spec.md §4.11 `GenerateInstructions`).
    async fn session_config_for(&self, room_id: &str) -> Option<SessionConfig> {
        let handle = self.room_store.get(room_id)?;
        let room = handle.read().await;
        Some(Self::build_session_config(&room.ai_config))
    }

    fn build_session_config(ai_config: &RoomAiConfig) -> SessionConfig {
        SessionConfig {
            instructions: ai_config.generate_instructions(),
            voice: ai_config.effective_voice(),
            temperature: ai_config.effective_temperature(),
        }
    }

    /// Opens the room's AI session (if not already open) using its current
    /// personality/voice/temperature configuration (spec.md §4.5, §4.11).
    async fn ensure_ai_session(&self, room_id: &str) {
        let Some(cfg) = self.session_config_for(room_id).await else { return };
        if let Err(err) = self.ai.ensure_session(room_id, cfg).await {
            warn!(room_id, %err, "failed to open ai session");
        }
    }

    /// Grants the head of the turn queue if one is ready; if the processor
    /// reports [`GrantOutcome::Deferred`] (an active turn in progress, or
    /// `min_turn_interval` cooldown not yet elapsed), schedules a background
    /// recheck instead of dropping the request on the floor.
    async fn try_grant_turn(self: &Arc<Self>, room_id: &str) {
        let mutation = self.turn_queue.process_next(room_id).await;
        match mutation.value {
            GrantOutcome::Granted(granted) => {
                self.ensure_ai_session(room_id).await;
                self.ai.on_turn_granted(room_id, granted.peer_id, granted.peer_display_name).await;
            }
            GrantOutcome::Deferred => {
                tokio::spawn(self.clone().retry_grant_turn(room_id.to_string()));
            }
            GrantOutcome::Empty => {}
        }
    }

    /// Polls `process_next` at `min_turn_interval` spacing until a deferred
    /// request grants or the queue drains; bounded so a room stuck with a
    /// permanently-active turn doesn't poll forever.
    async fn retry_grant_turn(self: Arc<Self>, room_id: RoomId) {
        let delay = self.turn_queue.min_turn_interval().max(Duration::from_millis(50));
        for _ in 0..10 {
            tokio::time::sleep(delay).await;
            let mutation = self.turn_queue.process_next(&room_id).await;
            match mutation.value {
                GrantOutcome::Granted(granted) => {
                    self.ensure_ai_session(&room_id).await;
                    self.ai.on_turn_granted(&room_id, granted.peer_id, granted.peer_display_name).await;
                    return;
                }
                GrantOutcome::Empty => return,
                GrantOutcome::Deferred => continue,
            }
        }
    }

    fn validate_display_name(&self, name: &str) -> Option<String> {
        let trimmed = name.trim();
        if trimmed.is_empty() || trimmed.chars().count() > self.join_name_max || trimmed.chars().count() < self.join_name_min {
            return None;
        }
        Some(trimmed.to_string())
    }

    async fn send_to(&self, room_id: &str, peer_id: PeerId, event: ServerEvent) {
        if let Some(room) = self.connections.get(room_id) {
            if let Some(conn) = room.get(&peer_id) {
                let _ = conn.sender.send(event).await;
            }
        }
    }

    async fn broadcast_room(&self, room_id: &str, event: ServerEvent, exclude: Option<PeerId>) {
        if let Some(room) = self.connections.get(room_id) {
            for entry in room.iter() {
                if Some(*entry.key()) != exclude {
                    let _ = entry.value().sender.send(event.clone()).await;
                }
            }
        }
    }

    /// Join admission policy (spec.md §4.2), in order: room exists → not
    /// closed → capacity available → display name valid.
    pub async fn join_room(
        &self,
        room_id: &str,
        owner_candidate: PeerId,
        display_name: String,
        avatar_url: Option<String>,
        sender: mpsc::Sender<ServerEvent>,
    ) -> Result<(), ServerEvent> {
        let error = |code: &str, message: &str| ServerEvent::RoomError {
            code: code.into(),
            message: message.into(),
            room_id: Some(room_id.to_string()),
        };

        let Some(handle) = self.room_store.get(room_id) else {
            return Err(error("ROOM_NOT_FOUND", "room not found"));
        };

        let (is_owner, status, participant_count, max_participants) = {
            let room = handle.read().await;
            (room.owner_id == owner_candidate, room.status, room.participant_count(), room.max_participants)
        };
        if status == RoomStatus::Closed {
            return Err(error("ROOM_CLOSED", "room is closed"));
        }
        if participant_count >= max_participants {
            return Err(error("ROOM_FULL", "room is full"));
        }

        let Some(valid_name) = self.validate_display_name(&display_name) else {
            return Err(error("INVALID_NAME", "display name must be 1-40 characters"));
        };

        let role = if is_owner { PeerRole::Owner } else { PeerRole::Participant };

        let peer = Peer {
            id: owner_candidate,
            display_name: valid_name,
            avatar_url,
            role,
            room_id: room_id.to_string(),
            joined_at: chrono::Utc::now(),
            presence: Presence::new(),
        };

        let summary = self
            .room_store
            .add_participant(room_id, peer.clone())
            .await
            .map_err(|e| error(e.code(), &e.to_string()))?;
        let _ = summary;

        let room_conns = self.connections.entry(room_id.to_string()).or_insert_with(DashMap::new);
        room_conns.insert(peer.id, Connection { peer_id: peer.id, sender: sender.clone() });
        drop(room_conns);

        self.presence.add_peer(room_id, peer.id).await;
        let became_occupied = self.audio.lock().unwrap().peer_joined(room_id);
        let _ = became_occupied;

        let (room_snapshot, peers) = {
            let room = handle.read().await;
            (room.clone(), room.participants.clone())
        };
        let ai_state = self.ai.snapshot_state(room_id).await;

        self.broadcast_room(room_id, ServerEvent::PeerJoined { peer: peer.clone() }, Some(peer.id)).await;
        self.send_to(
            room_id,
            peer.id,
            ServerEvent::RoomJoined { room: room_snapshot, local_peer: peer, peers, ai_state },
        )
        .await;
        Ok(())
    }

    /// `RoomLeave`, idempotent for peers not present.
    pub async fn leave_room(&self, room_id: &str, peer_id: PeerId) {
        self.room_store.remove_participant(room_id, peer_id).await;
        self.presence.remove_peer(room_id, peer_id, self).await;
        self.turn_queue.cancel_all_for_peer(room_id, peer_id).await;
        self.audio.lock().unwrap().peer_left(room_id, peer_id);
        if let Some(room) = self.connections.get(room_id) {
            room.remove(&peer_id);
        }
        self.broadcast_room(room_id, ServerEvent::PeerLeft { peer_id }, None).await;
    }

    /// Relays SDP/ICE verbatim, enforcing the target is in the same room;
    /// drops silently otherwise.
    pub async fn relay_signal(&self, room_id: &str, from: PeerId, event: ServerEvent, target: PeerId) {
        let Some(room) = self.connections.get(room_id) else {
            warn!(room_id, %target, "signal relay to unknown room dropped");
            return;
        };
        if room.get(&target).is_none() {
            debug!(room_id, %from, %target, "signal relay target not in room, dropped");
            return;
        }
        drop(room);
        self.send_to(room_id, target, event).await;
    }

    /// Full `ClientEvent` dispatch for one connected peer.
    pub async fn handle_client_event(self: &Arc<Self>, room_id: &str, peer_id: PeerId, event: ClientEvent) {
        match event {
            ClientEvent::RoomJoin { .. } => {
                // Join happens once, before the dispatch loop starts; a
                // second join on an already-open connection is a protocol
                // error and is logged, not acted on.
                warn!(room_id, %peer_id, "duplicate room:join on open connection");
            }
            ClientEvent::RoomLeave { room_id: rid } => {
                self.leave_room(&rid, peer_id).await;
            }
            ClientEvent::DisplayNameUpdate { name } => {
                let Some(valid) = self.validate_display_name(&name) else {
                    self.send_to(
                        room_id,
                        peer_id,
                        ServerEvent::RoomError {
                            code: "INVALID_NAME".into(),
                            message: "display name must be 1-40 characters".into(),
                            room_id: Some(room_id.to_string()),
                        },
                    )
                    .await;
                    return;
                };
                if let Some(handle) = self.room_store.get(room_id) {
                    let peer = {
                        let mut room = handle.write().await;
                        if let Some(p) = room.get_peer_mut(peer_id) {
                            p.display_name = valid;
                        }
                        room.get_peer(peer_id).cloned()
                    };
                    if let Some(peer) = peer {
                        self.broadcast_room(room_id, ServerEvent::PeerUpdated { peer }, None).await;
                    }
                }
            }
            ClientEvent::PresenceUpdate(partial) => {
                self.presence.update(room_id, peer_id, partial, self.clone()).await;
            }
            ClientEvent::PresenceHeartbeat => {
                self.presence.heartbeat(room_id, peer_id).await;
            }
            ClientEvent::SignalOffer { target_peer_id, sdp } => {
                self.relay_signal(room_id, peer_id, ServerEvent::SignalOffer { from_peer_id: peer_id, sdp }, target_peer_id).await;
            }
            ClientEvent::SignalAnswer { target_peer_id, sdp } => {
                self.relay_signal(room_id, peer_id, ServerEvent::SignalAnswer { from_peer_id: peer_id, sdp }, target_peer_id).await;
            }
            ClientEvent::SignalIce { target_peer_id, candidate } => {
                self.relay_signal(room_id, peer_id, ServerEvent::SignalIce { from_peer_id: peer_id, candidate }, target_peer_id).await;
            }
            ClientEvent::AiPttStart { room_id: rid } => {
                let role = self.peer_role(&rid, peer_id).await;
                let name = self.peer_name(&rid, peer_id).await.unwrap_or_default();
                if self.turn_queue.enqueue(&rid, peer_id, name, role).await.is_some() {
                    self.try_grant_turn(&rid).await;
                }
            }
            ClientEvent::AiPttEnd { room_id: rid } => {
                self.ai.on_ptt_end(&rid).await;
            }
            ClientEvent::AiAudioData { room_id: rid, audio } => {
                let frames = self.audio.lock().unwrap().ingest_wire_frame(
                    &rid,
                    peer_id,
                    &audio,
                    self.audio_input_sample_rate,
                    1,
                );
                for frame in frames {
                    self.ai.on_audio_data(&rid, &frame);
                }
            }
            ClientEvent::AiInterrupt { room_id: rid, source: _ } => {
                let role = self.peer_role(&rid, peer_id).await;
                match self.interrupt.request_interrupt(&rid, peer_id, role).await {
                    Ok(request_id) => {
                        self.interrupt.process_interrupt(&rid, request_id, self.ai.as_ref()).await;
                    }
                    Err(reason) => {
                        self.send_to(room_id, peer_id, ServerEvent::InterruptDenied { reason: format!("{reason:?}") }).await;
                    }
                }
            }
            ClientEvent::TranscriptRequestHistory { room_id: rid, limit, before_id, include_summaries } => {
                let page = self.context.get_entries(&rid, limit, 0, before_id).await;
                let summaries = if include_summaries { self.context.get_summaries(&rid).await } else { Vec::new() };
                let payload = serde_json::json!({ "entries": page.entries, "hasMore": page.has_more, "total": page.total, "summaries": summaries });
                self.send_to(room_id, peer_id, ServerEvent::TranscriptHistory { entries: payload }).await;
            }
            ClientEvent::SearchClear => {}
        }
    }

    async fn peer_role(&self, room_id: &str, peer_id: PeerId) -> PeerRole {
        let Some(handle) = self.room_store.get(room_id) else { return PeerRole::Participant };
        let room = handle.read().await;
        room.get_peer(peer_id).map(|p| p.role).unwrap_or(PeerRole::Participant)
    }

    async fn peer_name(&self, room_id: &str, peer_id: PeerId) -> Option<String> {
        let handle = self.room_store.get(room_id)?;
        let room = handle.read().await;
        room.get_peer(peer_id).map(|p| p.display_name.clone())
    }

    pub async fn close_room(&self, room_id: &str) {
        self.broadcast_room(room_id, ServerEvent::RoomClosed { room_id: room_id.to_string() }, None).await;
        self.connections.remove(room_id);
        self.ai.close_room(room_id).await;
        self.context.remove_room(room_id);
        self.turn_queue.remove_room(room_id);
        self.presence.remove_room(room_id);
        self.audio.lock().unwrap().remove_room(room_id);
    }
}

#[async_trait::async_trait]
impl Broadcaster for SignalingHub {
    async fn broadcast_ai_state(&self, room_id: &str, state: &RoomAiState) {
        self.broadcast_room(room_id, ServerEvent::AiState(state.clone()), None).await;
    }

    async fn broadcast_ai_audio(&self, room_id: &str, pcm_base64: &str) {
        self.broadcast_room(room_id, ServerEvent::AiAudio { pcm_base64: pcm_base64.to_string() }, None).await;
    }
}

#[async_trait::async_trait]
impl PresenceBroadcaster for SignalingHub {
    async fn broadcast_presence_update(&self, room_id: &str, peer_id: PeerId, presence: &Presence) {
        self.broadcast_room(room_id, ServerEvent::PresenceUpdate { peer_id, presence: presence.clone() }, None).await;
    }

    async fn broadcast_active_speaker(&self, room_id: &str, peer_id: Option<PeerId>) {
        self.broadcast_room(room_id, ServerEvent::AudioLevels { active_speaker: peer_id }, None).await;
    }

    async fn broadcast_peer_left(&self, room_id: &str, peer_id: PeerId) {
        self.broadcast_room(room_id, ServerEvent::PeerLeft { peer_id }, None).await;
    }
}

/// Blocks on the connection's first client frame, which must be
/// `room:join` (spec.md §4.2) — any other event received before it is a
/// protocol error and is dropped rather than acted on.
async fn read_join_frame(
    stream: &mut SplitStream<WebSocket>,
    room_id: &str,
    peer_id: PeerId,
) -> Option<(String, Option<String>)> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(ClientEvent::RoomJoin { display_name, avatar_url, .. }) => {
                    return Some((display_name, avatar_url));
                }
                Ok(_) => {
                    debug!(room_id, %peer_id, "ignored client event received before room:join");
                }
                Err(err) => {
                    debug!(%err, "malformed client event before room:join, dropped");
                }
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(err)) => {
                warn!(%err, "websocket read error before room:join");
                return None;
            }
            _ => {}
        }
    }
}

/// Per-connection reader/writer loop: a single-threaded reader
/// cooperatively dispatches to handlers; the writer task drains the
/// outbound channel independently (spec.md §4.2 scheduling model).
pub async fn handle_socket(socket: WebSocket, hub: Arc<SignalingHub>, room_id: RoomId, peer_id: PeerId) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(256);

    let Some((display_name, avatar_url)) = read_join_frame(&mut stream, &room_id, peer_id).await else {
        return;
    };

    if let Err(err) = hub.join_room(&room_id, peer_id, display_name, avatar_url, tx.clone()).await {
        let _ = tx.send(err).await;
    }

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut joined_rooms: HashSet<RoomId> = HashSet::new();
    joined_rooms.insert(room_id.clone());

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => hub.handle_client_event(&room_id, peer_id, event).await,
                Err(err) => debug!(%err, "malformed client event, dropped"),
            },
            Ok(Message::Close(_)) => break,
            Err(err) => {
                warn!(%err, "websocket read error");
                break;
            }
            _ => {}
        }
    }

    hub.leave_room(&room_id, peer_id).await;
    writer.abort();
    info!(room_id = %room_id, %peer_id, "connection closed");
}
