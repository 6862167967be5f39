//! In-memory adapter used for tests and as a safe default in
//! `Config::default_for_test` — no network calls.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::Sender;

use super::queue::OutboundQueue;
use super::types::{
    OutboundMsg, ProviderCapabilities, ProviderConnectionState, ProviderError, ProviderEvent,
    SessionConfig, ToolSpec,
};
use super::VoiceProviderAdapter;
use crate::personality::Personality;
use crate::room::{PeerId, RoomId};

struct MockSession {
    connected: bool,
    queue: Arc<OutboundQueue>,
}

/// Adapter that immediately "connects" and echoes back a canned
/// transcript delta + response-done for every commit, useful for exercising
/// the AI Orchestrator state machine without a real vendor.
pub struct MockAdapter {
    sessions: DashMap<RoomId, MockSession>,
}

impl MockAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self { sessions: DashMap::new() }
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl VoiceProviderAdapter for MockAdapter {
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supported_sample_rates: vec![16_000, 24_000],
            auto_transcribes: true,
            supports_inband_search: false,
        }
    }

    async fn create_session(
        &self,
        room_id: &str,
        _cfg: SessionConfig,
        events: Sender<ProviderEvent>,
    ) -> Result<(), ProviderError> {
        let queue = Arc::new(OutboundQueue::new(64));
        self.sessions.insert(
            room_id.to_string(),
            MockSession { connected: true, queue: queue.clone() },
        );
        let _ = events.send(ProviderEvent::StateChange(ProviderConnectionState::Connected)).await;

        tokio::spawn(async move {
            loop {
                match queue.pop().await {
                    OutboundMsg::CommitAudio => {
                        let _ = events.send(ProviderEvent::AudioData("bW9jaw==".into())).await;
                        let _ = events
                            .send(ProviderEvent::TranscriptDelta {
                                role: "assistant".into(),
                                text: "Okay.".into(),
                            })
                            .await;
                        let _ = events.send(ProviderEvent::ResponseDone).await;
                    }
                    OutboundMsg::TriggerResponse => {
                        let _ = events.send(ProviderEvent::ResponseDone).await;
                    }
                    OutboundMsg::CancelResponse => {}
                    _ => {}
                }
            }
        });
        Ok(())
    }

    async fn close_session(&self, room_id: &str) {
        self.sessions.remove(room_id);
    }

    async fn is_session_connected(&self, room_id: &str) -> bool {
        self.sessions.get(room_id).map(|s| s.connected).unwrap_or(false)
    }

    fn send_audio(&self, _room_id: &str, _pcm_base64: &str) {
        // Mock adapter does not need raw audio to produce a transcript.
    }

    fn commit_audio(&self, room_id: &str) {
        if let Some(s) = self.sessions.get(room_id) {
            s.queue.push(OutboundMsg::CommitAudio);
        }
    }

    fn trigger_response(&self, room_id: &str) {
        if let Some(s) = self.sessions.get(room_id) {
            s.queue.push(OutboundMsg::TriggerResponse);
        }
    }

    async fn cancel_response(&self, room_id: &str) -> bool {
        if let Some(s) = self.sessions.get(room_id) {
            s.queue.push(OutboundMsg::CancelResponse);
            true
        } else {
            false
        }
    }

    fn register_tools(&self, _room_id: &str, _tools: Vec<ToolSpec>) {}

    fn send_function_output(&self, _room_id: &str, _call_id: &str, _output: serde_json::Value) {}

    fn inject_context(&self, _room_id: &str, _text: &str) {}

    fn set_active_speaker(&self, _room_id: &str, _peer_id: PeerId, _name: &str) {}

    fn get_voice(&self, personality: Personality) -> String {
        super::default_voice_for(personality)
    }

    fn get_temperature(&self, personality: Personality) -> f32 {
        super::default_temperature_for(personality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn commit_audio_yields_a_response_done_event() {
        let adapter = MockAdapter::new();
        let (tx, mut rx) = mpsc::channel(8);
        adapter
            .create_session(
                "room1",
                SessionConfig { instructions: String::new(), voice: "default".into(), temperature: 0.8 },
                tx,
            )
            .await
            .unwrap();

        assert!(adapter.is_session_connected("room1").await);
        adapter.commit_audio("room1");

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ProviderEvent::StateChange(ProviderConnectionState::Connected)));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ProviderEvent::AudioData(_)));
        let third = rx.recv().await.unwrap();
        assert!(matches!(third, ProviderEvent::TranscriptDelta { .. }));
        let fourth = rx.recv().await.unwrap();
        assert!(matches!(fourth, ProviderEvent::ResponseDone));
    }
}
