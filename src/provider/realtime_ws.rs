//! Generic low-latency bidirectional websocket voice-AI adapter (spec.md
//! §6: "a low-latency bidirectional voice API"), representative of the
//! primary production vendor.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::queue::OutboundQueue;
use super::types::{
    OutboundMsg, ProviderCapabilities, ProviderConnectionState, ProviderError, ProviderEvent,
    SessionConfig, ToolSpec,
};
use super::VoiceProviderAdapter;
use crate::personality::Personality;
use crate::room::{PeerId, RoomId};

/// Wire envelope exchanged with the realtime websocket endpoint. The
/// concrete vendor protocol is intentionally abstracted behind this shape;
/// only the fields the core cares about cross the adapter boundary.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutEnvelope<'a> {
    Session { instructions: &'a str, voice: &'a str, temperature: f32 },
    Audio { pcm_base64: &'a str },
    Commit,
    Respond,
    Cancel,
    RegisterTools { tools: &'a [ToolSpec] },
    FunctionOutput { call_id: &'a str, output: &'a serde_json::Value },
    InjectContext { text: &'a str },
    ActiveSpeaker { peer_id: PeerId, name: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InEnvelope {
    TranscriptDelta { role: String, text: String },
    AudioDelta { pcm_base64: String },
    ResponseDone,
    FunctionCall { name: String, call_id: String, args: serde_json::Value },
    Error { kind: String, message: String },
}

struct Session {
    connected: Arc<std::sync::atomic::AtomicBool>,
    queue: Arc<OutboundQueue>,
}

pub struct RealtimeWsAdapter {
    ws_url: String,
    api_key: Option<String>,
    sessions: DashMap<RoomId, Session>,
}

impl RealtimeWsAdapter {
    #[must_use]
    pub fn new(ws_url: String, api_key: Option<String>) -> Self {
        Self { ws_url, api_key, sessions: DashMap::new() }
    }
}

#[async_trait::async_trait]
impl VoiceProviderAdapter for RealtimeWsAdapter {
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supported_sample_rates: vec![24_000],
            auto_transcribes: true,
            supports_inband_search: false,
        }
    }

    async fn create_session(
        &self,
        room_id: &str,
        cfg: SessionConfig,
        events: Sender<ProviderEvent>,
    ) -> Result<(), ProviderError> {
        let mut request = self
            .ws_url
            .clone()
            .into_client_request()
            .map_err(|_| ProviderError::ConnectFailed)?;
        if let Some(ref key) = self.api_key {
            request.headers_mut().insert(
                "authorization",
                format!("Bearer {key}").parse().map_err(|_| ProviderError::ConnectFailed)?,
            );
        }

        let (ws, _resp) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|_| ProviderError::ConnectFailed)?;
        let (mut sink, mut stream) = ws.split();

        let connected = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let queue = Arc::new(OutboundQueue::new(256));
        self.sessions.insert(
            room_id.to_string(),
            Session { connected: connected.clone(), queue: queue.clone() },
        );

        let session_env = OutEnvelope::Session {
            instructions: &cfg.instructions,
            voice: &cfg.voice,
            temperature: cfg.temperature,
        };
        if let Ok(text) = serde_json::to_string(&session_env) {
            let _ = sink.send(Message::Text(text.into())).await;
        }
        let _ = events.send(ProviderEvent::StateChange(ProviderConnectionState::Connected)).await;

        let writer_connected = connected.clone();
        tokio::spawn(async move {
            loop {
                let msg = queue.pop().await;
                let envelope = match &msg {
                    OutboundMsg::Audio(pcm) => OutEnvelope::Audio { pcm_base64: pcm },
                    OutboundMsg::CommitAudio => OutEnvelope::Commit,
                    OutboundMsg::TriggerResponse => OutEnvelope::Respond,
                    OutboundMsg::CancelResponse => OutEnvelope::Cancel,
                    OutboundMsg::RegisterTools(tools) => OutEnvelope::RegisterTools { tools },
                    OutboundMsg::FunctionOutput { call_id, output } => {
                        OutEnvelope::FunctionOutput { call_id, output }
                    }
                    OutboundMsg::InjectContext(text) => OutEnvelope::InjectContext { text },
                    OutboundMsg::SetActiveSpeaker { peer_id, name } => {
                        OutEnvelope::ActiveSpeaker { peer_id: *peer_id, name }
                    }
                };
                let Ok(text) = serde_json::to_string(&envelope) else { continue };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    writer_connected.store(false, std::sync::atomic::Ordering::Relaxed);
                    break;
                }
            }
        });

        let reader_connected = connected;
        let reader_events = events.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let Ok(Message::Text(text)) = frame else { continue };
                match serde_json::from_str::<InEnvelope>(&text) {
                    Ok(InEnvelope::TranscriptDelta { role, text }) => {
                        let _ = reader_events.send(ProviderEvent::TranscriptDelta { role, text }).await;
                    }
                    Ok(InEnvelope::AudioDelta { pcm_base64 }) => {
                        let _ = reader_events.send(ProviderEvent::AudioData(pcm_base64)).await;
                    }
                    Ok(InEnvelope::ResponseDone) => {
                        let _ = reader_events.send(ProviderEvent::ResponseDone).await;
                    }
                    Ok(InEnvelope::FunctionCall { name, call_id, args }) => {
                        let _ = reader_events
                            .send(ProviderEvent::FunctionCall { name, call_id, args_json: args })
                            .await;
                    }
                    Ok(InEnvelope::Error { kind, message }) => {
                        let _ = reader_events.send(ProviderEvent::Error { kind, message }).await;
                    }
                    Err(err) => debug!(%err, "unrecognized provider frame, dropped"),
                }
            }
            reader_connected.store(false, std::sync::atomic::Ordering::Relaxed);
            let _ = reader_events
                .send(ProviderEvent::StateChange(ProviderConnectionState::Disconnected))
                .await;
        });

        Ok(())
    }

    async fn close_session(&self, room_id: &str) {
        if let Some((_, session)) = self.sessions.remove(room_id) {
            session.connected.store(false, std::sync::atomic::Ordering::Relaxed);
        }
    }

    async fn is_session_connected(&self, room_id: &str) -> bool {
        self.sessions
            .get(room_id)
            .map(|s| s.connected.load(std::sync::atomic::Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn send_audio(&self, room_id: &str, pcm_base64: &str) {
        if let Some(s) = self.sessions.get(room_id) {
            s.queue.push(OutboundMsg::Audio(pcm_base64.to_string()));
        } else {
            warn!(room_id, "send_audio with no active session, dropped");
        }
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

    fn register_tools(&self, room_id: &str, tools: Vec<ToolSpec>) {
        if let Some(s) = self.sessions.get(room_id) {
            s.queue.push(OutboundMsg::RegisterTools(tools));
        }
    }

    fn send_function_output(&self, room_id: &str, call_id: &str, output: serde_json::Value) {
        if let Some(s) = self.sessions.get(room_id) {
            s.queue.push(OutboundMsg::FunctionOutput { call_id: call_id.to_string(), output });
        }
    }

    fn inject_context(&self, room_id: &str, text: &str) {
        if let Some(s) = self.sessions.get(room_id) {
            s.queue.push(OutboundMsg::InjectContext(text.to_string()));
        }
    }

    fn set_active_speaker(&self, room_id: &str, peer_id: PeerId, name: &str) {
        if let Some(s) = self.sessions.get(room_id) {
            s.queue.push(OutboundMsg::SetActiveSpeaker { peer_id, name: name.to_string() });
        }
    }

    fn get_voice(&self, personality: Personality) -> String {
        super::default_voice_for(personality)
    }

    fn get_temperature(&self, personality: Personality) -> f32 {
        super::default_temperature_for(personality)
    }
}
