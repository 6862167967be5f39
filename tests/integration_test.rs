//! Integration tests exercising the public surface of several components
//! together, the way `tests/integration/*.rs` does in the teacher's suite.
//! No external services are required: this crate's state is entirely
//! in-memory, so a `MockAdapter` and small local broadcaster stand in for
//! the voice-AI provider and the Signaling Hub.

use std::sync::Arc;
use std::time::Duration;

use room_coordination_engine::ai::{AiOrchestrator, Broadcaster, FunctionCallHandler};
use room_coordination_engine::interrupt::{DenyReason, InterruptConfig, InterruptHandler};
use room_coordination_engine::presence::{PresenceBroadcaster, PresenceTracker};
use room_coordination_engine::provider::{build_adapter, ProviderKind, SessionConfig};
use room_coordination_engine::room::{CreateRoomRequest, PeerId, PeerRole, PresenceUpdate, RoomStore};
use room_coordination_engine::search::SearchBridge;
use room_coordination_engine::summarization::SummarizationService;
use room_coordination_engine::transcript::ContextManager;
use room_coordination_engine::turn_queue::{GrantOutcome, TurnQueueProcessor};

struct NullBroadcaster;

#[async_trait::async_trait]
impl Broadcaster for NullBroadcaster {
    async fn broadcast_ai_state(&self, _room_id: &str, _state: &room_coordination_engine::ai::state::RoomAiState) {}
    async fn broadcast_ai_audio(&self, _room_id: &str, _pcm_base64: &str) {}
}

#[async_trait::async_trait]
impl PresenceBroadcaster for NullBroadcaster {
    async fn broadcast_presence_update(&self, _room_id: &str, _peer_id: PeerId, _presence: &room_coordination_engine::room::Presence) {}
    async fn broadcast_active_speaker(&self, _room_id: &str, _peer_id: Option<PeerId>) {}
    async fn broadcast_peer_left(&self, _room_id: &str, _peer_id: PeerId) {}
}

fn new_room_store() -> Arc<RoomStore> {
    Arc::new(RoomStore::new(2, 10, 6))
}

#[tokio::test]
async fn single_peer_round_trip_through_the_room_store() {
    let store = new_room_store();
    let owner_id = PeerId::new_v4();
    let handle = store
        .create(
            CreateRoomRequest {
                name: "Standup".into(),
                description: None,
                max_participants: Some(4),
                ai_personality: None,
                voice_settings: None,
            },
            owner_id,
        )
        .unwrap();

    let room_id = handle.id.clone();
    assert!(store.exists(&room_id));

    let peer = room_coordination_engine::room::Peer {
        id: owner_id,
        display_name: "Alice".into(),
        avatar_url: None,
        role: PeerRole::Owner,
        room_id: room_id.clone(),
        joined_at: chrono::Utc::now(),
        presence: room_coordination_engine::room::Presence::new(),
    };
    let summary = store.add_participant(&room_id, peer).await.unwrap();
    assert_eq!(summary.participant_count, 1);

    store.remove_participant(&room_id, owner_id).await;
    let room = handle.read().await;
    assert_eq!(room.participant_count(), 0);
}

#[tokio::test]
async fn capacity_is_enforced_once_the_room_fills() {
    let store = new_room_store();
    let owner_id = PeerId::new_v4();
    let handle = store
        .create(
            CreateRoomRequest {
                name: "Tiny room".into(),
                description: None,
                max_participants: Some(2),
                ai_personality: None,
                voice_settings: None,
            },
            owner_id,
        )
        .unwrap();
    let room_id = handle.id.clone();

    let make_peer = |id: PeerId, name: &str| room_coordination_engine::room::Peer {
        id,
        display_name: name.into(),
        avatar_url: None,
        role: PeerRole::Participant,
        room_id: room_id.clone(),
        joined_at: chrono::Utc::now(),
        presence: room_coordination_engine::room::Presence::new(),
    };

    store.add_participant(&room_id, make_peer(owner_id, "Alice")).await.unwrap();
    store.add_participant(&room_id, make_peer(PeerId::new_v4(), "Bob")).await.unwrap();

    let overflow = store.add_participant(&room_id, make_peer(PeerId::new_v4(), "Carol")).await;
    assert!(overflow.is_err());
}

#[tokio::test]
async fn turn_queue_grants_the_owner_ahead_of_participants_enqueued_earlier() {
    let queue = TurnQueueProcessor::new(
        20,
        Duration::from_secs(30),
        Duration::from_secs(60),
        100,
        Duration::from_millis(0),
        3,
    );
    let room_id = "r1";

    let participant_id = PeerId::new_v4();
    queue.enqueue(room_id, participant_id, "Participant".into(), PeerRole::Participant).await;

    let owner_id = PeerId::new_v4();
    queue.enqueue(room_id, owner_id, "Owner".into(), PeerRole::Owner).await;

    let first = queue.process_next(room_id).await;
    match first.value {
        GrantOutcome::Granted(req) => assert_eq!(req.peer_id, owner_id),
        other => panic!("expected the owner to be granted first, got {other:?}"),
    }
}

#[tokio::test]
async fn interrupt_handler_denies_non_owners_when_owner_only_is_set() {
    let store = new_room_store();
    let owner_id = PeerId::new_v4();
    let handle = store
        .create(
            CreateRoomRequest {
                name: "Locked room".into(),
                description: None,
                max_participants: None,
                ai_personality: None,
                voice_settings: None,
            },
            owner_id,
        )
        .unwrap();
    let room_id = handle.id.clone();

    let interrupt = InterruptHandler::new(
        store.clone(),
        InterruptConfig { owner_only: true, ..InterruptConfig::default() },
    );

    let denied = interrupt.request_interrupt(&room_id, PeerId::new_v4(), PeerRole::Participant).await;
    assert_eq!(denied, Err(DenyReason::RoleNotPermitted));

    let allowed = interrupt.request_interrupt(&room_id, owner_id, PeerRole::Owner).await;
    assert!(allowed.is_ok());
}

#[tokio::test]
async fn presence_update_suppresses_a_broadcast_within_the_noise_floor() {
    let tracker = Arc::new(PresenceTracker::new(Duration::from_millis(5)));
    let broadcaster: Arc<dyn PresenceBroadcaster> = Arc::new(NullBroadcaster);
    let room_id = "r1";
    let peer_id = PeerId::new_v4();
    tracker.add_peer(room_id, peer_id).await;

    tracker
        .update(
            room_id,
            peer_id,
            PresenceUpdate { is_speaking: Some(true), audio_level: Some(0.50), ..Default::default() },
            broadcaster.clone(),
        )
        .await;

    tracker
        .update(
            room_id,
            peer_id,
            PresenceUpdate { audio_level: Some(0.52), ..Default::default() },
            broadcaster,
        )
        .await;

    let snapshot = tracker.snapshot(room_id).await;
    let (_, presence) = snapshot.iter().find(|(id, _)| *id == peer_id).expect("peer present");
    assert!((presence.audio.audio_level - 0.52).abs() < f32::EPSILON);
}

#[tokio::test]
async fn a_full_turn_grant_to_response_cycle_updates_the_transcript() {
    let context = Arc::new(ContextManager::new(1000));
    let turn_queue = Arc::new(TurnQueueProcessor::new(
        20,
        Duration::from_secs(30),
        Duration::from_secs(60),
        100,
        Duration::from_millis(0),
        3,
    ));
    let adapter = build_adapter(ProviderKind::Mock, None, None, None);
    let broadcaster: Arc<dyn Broadcaster> = Arc::new(NullBroadcaster);
    let search = Arc::new(SearchBridge::new(None, None));
    let function_calls: Arc<dyn FunctionCallHandler> = search;
    let summarization = Arc::new(SummarizationService::new(
        None,
        None,
        context.clone(),
        new_room_store(),
        30,
        Duration::from_secs(600),
        Duration::from_secs(5),
    ));

    let orchestrator = AiOrchestrator::new(
        adapter,
        context.clone(),
        turn_queue,
        broadcaster,
        function_calls,
        summarization,
        Duration::from_secs(1),
    );

    let room_id = "r1";
    orchestrator
        .ensure_session(
            room_id,
            SessionConfig { instructions: "Be helpful.".into(), voice: "default".into(), temperature: 0.7 },
        )
        .await
        .unwrap();

    let peer_id = PeerId::new_v4();
    orchestrator.on_turn_granted(room_id, peer_id, "Alice".into()).await;
    orchestrator.on_ptt_end(room_id).await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    let page = context.get_entries(room_id, 10, 0, None).await;
    assert!(!page.entries.is_empty());
}
