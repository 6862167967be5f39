//! AI Orchestrator (spec.md §4.5): owns one provider session per room,
//! drives the [`state::RoomAiState`] machine, and fans state/audio/
//! transcript changes out through small injected capability interfaces
//! (spec.md §9 "cyclic ownership ... inject small capability interfaces"),
//! rather than holding the Signaling Hub or Search Bridge directly.

pub mod state;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use crate::provider::{ProviderEvent, SessionConfig, VoiceProviderAdapter};
use crate::room::{PeerId, RoomId};
use crate::summarization::SummarizationService;
use crate::transcript::{ContextManager, TranscriptEntryKind};
use crate::turn_queue::{GrantOutcome, TurnQueueProcessor, TurnRequest};
use state::{AiEvent, RoomAiState};

/// Injected so the orchestrator never holds the Signaling Hub directly.
#[async_trait::async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast_ai_state(&self, room_id: &str, state: &RoomAiState);
    async fn broadcast_ai_audio(&self, room_id: &str, pcm_base64: &str);
}

/// Injected so the orchestrator never holds the Search Bridge directly
/// (spec.md §4.12: "must never call back into C5 synchronously").
#[async_trait::async_trait]
pub trait FunctionCallHandler: Send + Sync {
    async fn handle(&self, room_id: &str, name: &str, args: serde_json::Value) -> serde_json::Value;
}

struct RoomSession {
    state: Mutex<RoomAiState>,
    pending_response: Mutex<String>,
    cfg: SessionConfig,
}

/// Process-wide AI Orchestrator, one [`RoomSession`] lazily created per room
/// on first PTT.
pub struct AiOrchestrator {
    adapter: Arc<dyn VoiceProviderAdapter>,
    context: Arc<ContextManager>,
    turn_queue: Arc<TurnQueueProcessor>,
    broadcaster: Arc<dyn Broadcaster>,
    function_calls: Arc<dyn FunctionCallHandler>,
    summarization: Arc<SummarizationService>,
    sessions: Arc<DashMap<RoomId, Arc<RoomSession>>>,
    tool_call_timeout: Duration,
    lock_during_response: bool,
    auto_advance: bool,
}

impl AiOrchestrator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<dyn VoiceProviderAdapter>,
        context: Arc<ContextManager>,
        turn_queue: Arc<TurnQueueProcessor>,
        broadcaster: Arc<dyn Broadcaster>,
        function_calls: Arc<dyn FunctionCallHandler>,
        summarization: Arc<SummarizationService>,
        tool_call_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            context,
            turn_queue,
            broadcaster,
            function_calls,
            summarization,
            sessions: Arc::new(DashMap::new()),
            tool_call_timeout,
            lock_during_response: true,
            auto_advance: true,
        }
    }

    async fn current_state(&self, room_id: &str) -> RoomAiState {
        match self.sessions.get(room_id) {
            Some(s) => s.state.lock().await.clone(),
            None => RoomAiState::new(),
        }
    }

    async fn transition(&self, room_id: &str, event: AiEvent) -> Option<RoomAiState> {
        let session = self.sessions.get(room_id)?;
        let mut guard = session.state.lock().await;
        let current = guard.clone();
        match current.apply(event) {
            Ok(next) => {
                *guard = next.clone();
                drop(guard);
                self.broadcaster.broadcast_ai_state(room_id, &next).await;
                Some(next)
            }
            Err(err) => {
                warn!(room_id, %err, "dropped illegal ai-state transition");
                None
            }
        }
    }

    /// Lazily opens the provider session for a room (spec.md §4.5 "lazy-
    /// created on first PTT") and spawns the task that drains provider
    /// events for its lifetime.
    pub async fn ensure_session(&self, room_id: &str, cfg: SessionConfig) -> Result<(), crate::provider::ProviderError> {
        if self.sessions.contains_key(room_id) {
            return Ok(());
        }
        let session = Arc::new(RoomSession {
            state: Mutex::new(RoomAiState::new()),
            pending_response: Mutex::new(String::new()),
            cfg: SessionConfig {
                instructions: cfg.instructions.clone(),
                voice: cfg.voice.clone(),
                temperature: cfg.temperature,
            },
        });
        self.sessions.insert(room_id.to_string(), session);

        let (tx, rx) = mpsc::channel(256);
        self.adapter.create_session(room_id, cfg, tx).await?;

        let this_adapter = self.adapter.clone();
        let this_context = self.context.clone();
        let this_turn_queue = self.turn_queue.clone();
        let this_broadcaster = self.broadcaster.clone();
        let this_function_calls = self.function_calls.clone();
        let this_summarization = self.summarization.clone();
        let room_id_owned = room_id.to_string();
        let tool_timeout = self.tool_call_timeout;
        let auto_advance = self.auto_advance;
        let sessions = self.sessions.clone();

        tokio::spawn(Self::drain_provider_events(
            rx,
            room_id_owned,
            sessions,
            this_adapter,
            this_context,
            this_turn_queue,
            this_broadcaster,
            this_function_calls,
            this_summarization,
            tool_timeout,
            auto_advance,
        ));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn drain_provider_events(
        mut rx: mpsc::Receiver<ProviderEvent>,
        room_id: RoomId,
        sessions: Arc<DashMap<RoomId, Arc<RoomSession>>>,
        adapter: Arc<dyn VoiceProviderAdapter>,
        context: Arc<ContextManager>,
        turn_queue: Arc<TurnQueueProcessor>,
        broadcaster: Arc<dyn Broadcaster>,
        function_calls: Arc<dyn FunctionCallHandler>,
        summarization: Arc<SummarizationService>,
        tool_call_timeout: Duration,
        auto_advance: bool,
    ) {
        while let Some(event) = rx.recv().await {
            let Some(session) = sessions.get(&room_id).map(|s| s.clone()) else { break };

            match event {
                ProviderEvent::StateChange(_) => {}
                ProviderEvent::AudioData(pcm) => {
                    let mut guard = session.state.lock().await;
                    if let Ok(next) = guard.clone().apply(AiEvent::ProviderAudioDelta) {
                        *guard = next.clone();
                        drop(guard);
                        broadcaster.broadcast_ai_state(&room_id, &next).await;
                        broadcaster.broadcast_ai_audio(&room_id, &pcm).await;
                    }
                }
                ProviderEvent::TranscriptDelta { text, .. } => {
                    session.pending_response.lock().await.push_str(&text);
                }
                ProviderEvent::ResponseDone => {
                    let text = std::mem::take(&mut *session.pending_response.lock().await);
                    if !text.is_empty() {
                        context
                            .append(&room_id, "AI".into(), None, text, TranscriptEntryKind::AiResponse)
                            .await;
                        summarization.note_entry_appended(&room_id).await;
                    }

                    let mut guard = session.state.lock().await;
                    if let Ok(next) = guard.clone().apply(AiEvent::ProviderResponseDone) {
                        *guard = next.clone();
                        drop(guard);
                        broadcaster.broadcast_ai_state(&room_id, &next).await;
                    } else {
                        drop(guard);
                    }

                    if let Some(mutation) = turn_queue.on_response_done(&room_id, auto_advance).await {
                        match mutation.value {
                            GrantOutcome::Granted(granted) => {
                                apply_turn_grant(&room_id, &sessions, &broadcaster, &adapter, granted).await;
                            }
                            GrantOutcome::Deferred => {
                                tokio::spawn(retry_turn_grant(
                                    room_id.clone(),
                                    sessions.clone(),
                                    turn_queue.clone(),
                                    broadcaster.clone(),
                                    adapter.clone(),
                                ));
                            }
                            GrantOutcome::Empty => {}
                        }
                    }
                }
                ProviderEvent::FunctionCall { name, call_id, args_json } => {
                    let room_id_inner = room_id.clone();
                    let adapter_inner = adapter.clone();
                    let handler = function_calls.clone();
                    tokio::spawn(async move {
                        let result = tokio::time::timeout(
                            tool_call_timeout,
                            handler.handle(&room_id_inner, &name, args_json),
                        )
                        .await
                        .unwrap_or_else(|_| serde_json::json!({ "error": "tool_timeout" }));
                        adapter_inner.send_function_output(&room_id_inner, &call_id, result);
                    });
                }
                ProviderEvent::Error { message, .. } => {
                    error!(room_id = %room_id, %message, "provider error");
                    let mut guard = session.state.lock().await;
                    if let Ok(next) = guard.clone().apply(AiEvent::ProviderError { message }) {
                        *guard = next.clone();
                        drop(guard);
                        broadcaster.broadcast_ai_state(&room_id, &next).await;
                    }
                }
            }
        }
    }

    /// `TurnGranted` entrypoint for the turn queue: transitions
    /// `idle -> listening`. The caller must have already called
    /// [`Self::ensure_session`] for this room — granting a turn with no
    /// open session is a no-op (`transition` drops the event silently).
    pub async fn on_turn_granted(&self, room_id: &str, peer_id: PeerId, name: String) {
        self.transition(room_id, AiEvent::TurnGranted { peer_id, name }).await;
    }

    /// Forwards VAD-gated audio to the provider (spec.md §4.5 "forward to
    /// provider after VAD gating").
    pub fn on_audio_data(&self, room_id: &str, pcm_base64: &str) {
        self.adapter.send_audio(room_id, pcm_base64);
    }

    pub async fn on_ptt_end(&self, room_id: &str) {
        if self.transition(room_id, AiEvent::PttEnd).await.is_some() {
            self.adapter.commit_audio(room_id);
        }
    }

    /// Invoked by the Interrupt Handler (spec.md §4.7) via this narrow
    /// capability surface rather than a direct dependency back into C7.
    pub async fn interrupt(&self, room_id: &str) -> bool {
        let cancelled = self.adapter.cancel_response(room_id).await;
        self.transition(
            room_id,
            AiEvent::InterruptAccepted { lock_during_response: self.lock_during_response, draining: false },
        )
        .await;
        self.turn_queue.end_turn(room_id, true).await;
        cancelled
    }

    pub async fn close_room(&self, room_id: &str) {
        self.adapter.close_session(room_id).await;
        self.sessions.remove(room_id);
    }

    pub async fn snapshot_state(&self, room_id: &str) -> RoomAiState {
        let mut s = self.current_state(room_id).await;
        s.queue = self.turn_queue.snapshot(room_id).await;
        s
    }
}

/// Applies a [`GrantOutcome::Granted`] turn to the room's AI state machine
/// and hands the floor to the provider; shared by the immediate grant path
/// and [`retry_turn_grant`]'s delayed recheck.
async fn apply_turn_grant(
    room_id: &RoomId,
    sessions: &Arc<DashMap<RoomId, Arc<RoomSession>>>,
    broadcaster: &Arc<dyn Broadcaster>,
    adapter: &Arc<dyn VoiceProviderAdapter>,
    granted: TurnRequest,
) {
    let Some(session) = sessions.get(room_id).map(|s| s.clone()) else { return };
    let mut guard = session.state.lock().await;
    if let Ok(next) = guard.clone().apply(AiEvent::TurnGranted { peer_id: granted.peer_id, name: granted.peer_display_name.clone() }) {
        *guard = next.clone();
        drop(guard);
        broadcaster.broadcast_ai_state(room_id, &next).await;
        adapter.set_active_speaker(room_id, granted.peer_id, &granted.peer_display_name);
    }
}

/// Polls `process_next` at `min_turn_interval` spacing until a
/// [`GrantOutcome::Deferred`] request grants or the queue drains; bounded so
/// a room stuck with a permanently-active turn doesn't poll forever.
async fn retry_turn_grant(
    room_id: RoomId,
    sessions: Arc<DashMap<RoomId, Arc<RoomSession>>>,
    turn_queue: Arc<TurnQueueProcessor>,
    broadcaster: Arc<dyn Broadcaster>,
    adapter: Arc<dyn VoiceProviderAdapter>,
) {
    let delay = turn_queue.min_turn_interval().max(Duration::from_millis(50));
    for _ in 0..10 {
        tokio::time::sleep(delay).await;
        let mutation = turn_queue.process_next(&room_id).await;
        match mutation.value {
            GrantOutcome::Granted(granted) => {
                apply_turn_grant(&room_id, &sessions, &broadcaster, &adapter, granted).await;
                return;
            }
            GrantOutcome::Empty => return,
            GrantOutcome::Deferred => continue,
        }
    }
}

/// Lets the Interrupt Handler (spec.md §4.7) cancel an in-flight response
/// through the same narrow surface as [`Self::interrupt`], without owning
/// this type directly.
#[async_trait::async_trait]
impl crate::interrupt::Interrupter for AiOrchestrator {
    async fn interrupt(&self, room_id: &str) -> bool {
        AiOrchestrator::interrupt(self, room_id).await
    }
}

/// Breaks the construction cycle between the orchestrator and the
/// Signaling Hub: the hub implements [`Broadcaster`] but can't exist until
/// the orchestrator does. `main` builds one of these first, hands it to
/// `AiOrchestrator::new`, then calls [`Self::bind`] once the real hub is
/// built.
#[derive(Default)]
pub struct DeferredBroadcaster {
    target: tokio::sync::OnceCell<Arc<dyn Broadcaster>>,
}

impl DeferredBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Panics if called twice; `main` calls this exactly once at startup.
    pub fn bind(&self, target: Arc<dyn Broadcaster>) {
        self.target.set(target).ok().expect("DeferredBroadcaster bound twice");
    }
}

#[async_trait::async_trait]
impl Broadcaster for DeferredBroadcaster {
    async fn broadcast_ai_state(&self, room_id: &str, state: &RoomAiState) {
        if let Some(target) = self.target.get() {
            target.broadcast_ai_state(room_id, state).await;
        }
    }

    async fn broadcast_ai_audio(&self, room_id: &str, pcm_base64: &str) {
        if let Some(target) = self.target.get() {
            target.broadcast_ai_audio(room_id, pcm_base64).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::state::AiState;
    use crate::provider::MockAdapter;
    use crate::room::RoomStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullBroadcaster {
        state_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Broadcaster for NullBroadcaster {
        async fn broadcast_ai_state(&self, _room_id: &str, _state: &RoomAiState) {
            self.state_calls.fetch_add(1, Ordering::Relaxed);
        }
        async fn broadcast_ai_audio(&self, _room_id: &str, _pcm_base64: &str) {}
    }

    struct EchoFunctionCalls;

    #[async_trait::async_trait]
    impl FunctionCallHandler for EchoFunctionCalls {
        async fn handle(&self, _room_id: &str, _name: &str, _args: serde_json::Value) -> serde_json::Value {
            serde_json::json!({ "ok": true })
        }
    }

    #[tokio::test]
    async fn turn_granted_then_ptt_end_drives_a_full_response_cycle() {
        let adapter = Arc::new(MockAdapter::new());
        let context = Arc::new(ContextManager::new(1000));
        let turn_queue = Arc::new(TurnQueueProcessor::new(
            20,
            Duration::from_secs(30),
            Duration::from_secs(60),
            100,
            Duration::from_millis(0),
            3,
        ));
        let broadcaster = Arc::new(NullBroadcaster { state_calls: AtomicUsize::new(0) });
        let room_store = Arc::new(RoomStore::new(2, 10, 6));
        let summarization = Arc::new(SummarizationService::new(
            None,
            None,
            context.clone(),
            room_store,
            30,
            Duration::from_secs(600),
            Duration::from_secs(5),
        ));
        let orchestrator = AiOrchestrator::new(
            adapter,
            context.clone(),
            turn_queue,
            broadcaster.clone(),
            Arc::new(EchoFunctionCalls),
            summarization,
            Duration::from_secs(1),
        );

        let room_id = "room1";
        let peer_id = PeerId::new_v4();
        orchestrator
            .ensure_session(
                room_id,
                SessionConfig { instructions: "hi".into(), voice: "default".into(), temperature: 0.8 },
            )
            .await
            .unwrap();
        orchestrator.on_turn_granted(room_id, peer_id, "Alice".into()).await;
        assert_eq!(orchestrator.current_state(room_id).await.state, AiState::Listening);

        orchestrator.on_ptt_end(room_id).await;

        // Give the mock adapter's event loop a moment to deliver the canned
        // transcript + response-done events.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orchestrator.current_state(room_id).await.state, AiState::Idle);

        let page = context.get_entries(room_id, 10, 0, None).await;
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].content, "Okay.");
    }
}
