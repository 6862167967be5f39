//! Provider Adapters (spec.md §4.6): capability interface to concrete
//! voice-AI backends, so the AI Orchestrator never depends on a vendor wire
//! protocol directly.

mod mock;
mod polling_http;
mod queue;
mod realtime_ws;
mod types;

pub use mock::MockAdapter;
pub use polling_http::PollingHttpAdapter;
pub use realtime_ws::RealtimeWsAdapter;
pub use types::{
    default_temperature_for, default_voice_for, OutboundMsg, ProviderCapabilities,
    ProviderConnectionState, ProviderError, ProviderEvent, ProviderKind, SessionConfig, ToolSpec,
};

use crate::personality::Personality;
use crate::room::PeerId;

/// Capability interface every concrete adapter implements (spec.md §4.6).
/// Adapters are stateless with respect to the core data model; they only
/// hold the provider connection, keyed internally by room id.
#[async_trait::async_trait]
pub trait VoiceProviderAdapter: Send + Sync {
    fn capabilities(&self) -> ProviderCapabilities;

    async fn create_session(
        &self,
        room_id: &str,
        cfg: SessionConfig,
        events: tokio::sync::mpsc::Sender<ProviderEvent>,
    ) -> Result<(), ProviderError>;

    async fn close_session(&self, room_id: &str);

    async fn is_session_connected(&self, room_id: &str) -> bool;

    /// Never blocks more than a bounded push; drops on backpressure
    /// (spec.md §4.6: "never blocks > 50ms; drops on backpressure").
    fn send_audio(&self, room_id: &str, pcm_base64: &str);

    fn commit_audio(&self, room_id: &str);

    fn trigger_response(&self, room_id: &str);

    /// Used by the Interrupt Handler; returns whether a response was
    /// actually in flight to cancel.
    async fn cancel_response(&self, room_id: &str) -> bool;

    fn register_tools(&self, room_id: &str, tools: Vec<ToolSpec>);

    fn send_function_output(&self, room_id: &str, call_id: &str, output: serde_json::Value);

    fn inject_context(&self, room_id: &str, text: &str);

    fn set_active_speaker(&self, room_id: &str, peer_id: PeerId, name: &str);

    fn get_voice(&self, personality: Personality) -> String {
        default_voice_for(personality)
    }

    fn get_temperature(&self, personality: Personality) -> f32 {
        default_temperature_for(personality)
    }
}

/// Construct the configured adapter. Grounded on the provider-selection
/// enum pattern used across `Config` (spec.md §6: "a single configuration
/// enum").
#[must_use]
pub fn build_adapter(
    kind: ProviderKind,
    ws_url: Option<String>,
    http_url: Option<String>,
    api_key: Option<String>,
) -> std::sync::Arc<dyn VoiceProviderAdapter> {
    match kind {
        ProviderKind::RealtimeWs => std::sync::Arc::new(RealtimeWsAdapter::new(
            ws_url.unwrap_or_default(),
            api_key,
        )),
        ProviderKind::PollingHttp => std::sync::Arc::new(PollingHttpAdapter::new(
            http_url.unwrap_or_default(),
            api_key,
        )),
        ProviderKind::Mock => std::sync::Arc::new(MockAdapter::new()),
    }
}
