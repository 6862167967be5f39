//! Chunked request/response voice-AI adapter (spec.md §6: "one alternate"
//! vendor), representative of a polling HTTP-based backend rather than a
//! persistent streaming socket.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc::Sender;
use tracing::warn;

use super::queue::OutboundQueue;
use super::types::{
    OutboundMsg, ProviderCapabilities, ProviderConnectionState, ProviderError, ProviderEvent,
    SessionConfig, ToolSpec,
};
use super::VoiceProviderAdapter;
use crate::personality::Personality;
use crate::room::{PeerId, RoomId};

#[derive(Debug, Serialize)]
struct TurnRequestBody {
    instructions: String,
    voice: String,
    temperature: f32,
    audio_base64: String,
}

#[derive(Debug, serde::Deserialize)]
struct TurnResponseBody {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    function_call: Option<PolledFunctionCall>,
}

#[derive(Debug, serde::Deserialize)]
struct PolledFunctionCall {
    name: String,
    call_id: String,
    args: serde_json::Value,
}

struct Session {
    connected: Arc<std::sync::atomic::AtomicBool>,
    queue: Arc<OutboundQueue>,
    cfg: SessionConfig,
    audio_buffer: std::sync::Mutex<String>,
}

/// Buffers audio until `commit_audio`, then issues a single blocking HTTP
/// round-trip per turn instead of streaming — no persistent connection to
/// keep alive or reconnect.
pub struct PollingHttpAdapter {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    sessions: DashMap<RoomId, Session>,
}

impl PollingHttpAdapter {
    #[must_use]
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url,
            api_key,
            client: reqwest::Client::new(),
            sessions: DashMap::new(),
        }
    }

    async fn run_turn(
        base_url: String,
        api_key: Option<String>,
        client: reqwest::Client,
        cfg: SessionConfig,
        audio_base64: String,
        events: Sender<ProviderEvent>,
    ) {
        let body = TurnRequestBody {
            instructions: cfg.instructions,
            voice: cfg.voice,
            temperature: cfg.temperature,
            audio_base64,
        };
        let mut req = client.post(format!("{base_url}/turns")).json(&body);
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<TurnResponseBody>().await {
                Ok(parsed) => {
                    if !parsed.transcript.is_empty() {
                        let _ = events
                            .send(ProviderEvent::TranscriptDelta {
                                role: "assistant".into(),
                                text: parsed.transcript,
                            })
                            .await;
                    }
                    if let Some(call) = parsed.function_call {
                        let _ = events
                            .send(ProviderEvent::FunctionCall {
                                name: call.name,
                                call_id: call.call_id,
                                args_json: call.args,
                            })
                            .await;
                    }
                    let _ = events.send(ProviderEvent::ResponseDone).await;
                }
                Err(err) => {
                    let _ = events
                        .send(ProviderEvent::Error { kind: "decode".into(), message: err.to_string() })
                        .await;
                }
            },
            Ok(resp) => {
                let status = resp.status();
                let _ = events
                    .send(ProviderEvent::Error { kind: "http".into(), message: status.to_string() })
                    .await;
            }
            Err(err) => {
                let _ = events
                    .send(ProviderEvent::Error { kind: "transport".into(), message: err.to_string() })
                    .await;
            }
        }
    }
}

#[async_trait::async_trait]
impl VoiceProviderAdapter for PollingHttpAdapter {
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supported_sample_rates: vec![16_000],
            auto_transcribes: false,
            supports_inband_search: false,
        }
    }

    async fn create_session(
        &self,
        room_id: &str,
        cfg: SessionConfig,
        events: Sender<ProviderEvent>,
    ) -> Result<(), ProviderError> {
        let connected = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let queue = Arc::new(OutboundQueue::new(32));
        self.sessions.insert(
            room_id.to_string(),
            Session {
                connected: connected.clone(),
                queue: queue.clone(),
                cfg: SessionConfig {
                    instructions: cfg.instructions.clone(),
                    voice: cfg.voice.clone(),
                    temperature: cfg.temperature,
                },
                audio_buffer: std::sync::Mutex::new(String::new()),
            },
        );
        let _ = events.send(ProviderEvent::StateChange(ProviderConnectionState::Connected)).await;

        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();
        let client = self.client.clone();
        let worker_connected = connected;
        tokio::spawn(async move {
            loop {
                if !worker_connected.load(std::sync::atomic::Ordering::Relaxed) {
                    break;
                }
                let Ok(msg) = tokio::time::timeout(Duration::from_secs(60), queue.pop()).await
                else {
                    continue;
                };
                let OutboundMsg::FunctionOutput { call_id, output } = msg else { continue };
                if call_id != "__commit__" {
                    continue;
                }
                let audio_base64 = match output {
                    serde_json::Value::String(s) => s,
                    _ => String::new(),
                };
                Self::run_turn(
                    base_url.clone(),
                    api_key.clone(),
                    client.clone(),
                    SessionConfig {
                        instructions: cfg.instructions.clone(),
                        voice: cfg.voice.clone(),
                        temperature: cfg.temperature,
                    },
                    audio_base64,
                    events.clone(),
                )
                .await;
            }
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
        let Some(session) = self.sessions.get(room_id) else {
            warn!(room_id, "send_audio with no active session, dropped");
            return;
        };
        let mut buf = session.audio_buffer.lock().expect("audio buffer mutex poisoned");
        buf.push_str(pcm_base64);
    }

    fn commit_audio(&self, room_id: &str) {
        let Some(session) = self.sessions.get(room_id) else { return };
        let audio_base64 = {
            let mut buf = session.audio_buffer.lock().expect("audio buffer mutex poisoned");
            std::mem::take(&mut *buf)
        };
        session.queue.push(OutboundMsg::FunctionOutput {
            call_id: "__commit__".into(),
            output: serde_json::Value::String(audio_base64),
        });
    }

    fn trigger_response(&self, room_id: &str) {
        // The polling adapter commits and triggers in one HTTP call; a bare
        // trigger with no new audio re-sends the last buffered turn.
        self.commit_audio(room_id);
    }

    async fn cancel_response(&self, _room_id: &str) -> bool {
        // A single blocking HTTP call in flight cannot be cancelled
        // server-side; the caller discards the eventual response instead.
        false
    }

    fn register_tools(&self, _room_id: &str, _tools: Vec<ToolSpec>) {
        // Tool declarations are sent inline with each `/turns` request in a
        // production implementation; omitted here for brevity.
    }

    fn send_function_output(&self, room_id: &str, call_id: &str, output: serde_json::Value) {
        if let Some(session) = self.sessions.get(room_id) {
            session.queue.push(OutboundMsg::FunctionOutput { call_id: call_id.to_string(), output });
        }
    }

    fn inject_context(&self, _room_id: &str, _text: &str) {}

    fn set_active_speaker(&self, _room_id: &str, _peer_id: PeerId, _name: &str) {}

    fn get_voice(&self, personality: Personality) -> String {
        super::default_voice_for(personality)
    }

    fn get_temperature(&self, personality: Personality) -> f32 {
        super::default_temperature_for(personality)
    }
}

