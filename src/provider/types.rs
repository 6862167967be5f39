//! Shared types for the Provider Adapter capability interface (spec.md §4.6).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::personality::Personality;
use crate::room::PeerId;

/// Which concrete adapter to construct at startup (spec.md §6: "adapters are
/// discovered at process startup by a single configuration enum").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    RealtimeWs,
    PollingHttp,
    Mock,
}

impl ProviderKind {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "realtime_ws" | "realtime-ws" | "realtimews" => Some(Self::RealtimeWs),
            "polling_http" | "polling-http" | "pollinghttp" => Some(Self::PollingHttp),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }
}

/// Errors surfaced by the adapter boundary (spec.md §7 "transient provider").
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("failed to connect to voice-AI provider")]
    ConnectFailed,
    #[error("no active session for this room")]
    NotConnected,
    #[error("provider request timed out")]
    Timeout,
    #[error("provider error: {0}")]
    Other(String),
}

/// Capability declaration an adapter reports about itself (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct ProviderCapabilities {
    pub supported_sample_rates: Vec<u32>,
    pub auto_transcribes: bool,
    /// Whether the adapter can perform web search in-band; the core always
    /// uses its own search bridge (C12) to keep behavior uniform across
    /// adapters regardless of this flag.
    pub supports_inband_search: bool,
}

/// Session configuration handed to `createSession` (derived from
/// `RoomAiConfig::generate_instructions`/`effective_voice`/`effective_temperature`).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    pub temperature: f32,
}

/// A tool made available to the provider for function-calling (spec.md §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Connection lifecycle of a provider session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Events an adapter surfaces to the AI Orchestrator (spec.md §4.6
/// callbacks), delivered over a bounded channel per the "callback soup →
/// message passing" design note (spec.md §9).
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    StateChange(ProviderConnectionState),
    AudioData(String),
    TranscriptDelta { role: String, text: String },
    ResponseDone,
    FunctionCall { name: String, call_id: String, args_json: serde_json::Value },
    Error { kind: String, message: String },
}

/// Messages queued for delivery to the provider connection, subject to the
/// drop-oldest-on-backpressure policy (spec.md §4.6 `sendAudio` note).
#[derive(Debug, Clone)]
pub enum OutboundMsg {
    Audio(String),
    CommitAudio,
    TriggerResponse,
    CancelResponse,
    RegisterTools(Vec<ToolSpec>),
    FunctionOutput { call_id: String, output: serde_json::Value },
    InjectContext(String),
    SetActiveSpeaker { peer_id: PeerId, name: String },
}

/// `getVoice`/`getTemperature` defaults, used by adapters that do not
/// override personality-specific behavior.
#[must_use]
pub fn default_voice_for(personality: Personality) -> String {
    personality.suggested_voice().to_string()
}

#[must_use]
pub fn default_temperature_for(personality: Personality) -> f32 {
    personality.suggested_temperature().clamp(0.0, 2.0)
}
