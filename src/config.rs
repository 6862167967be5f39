//! Server Configuration
//!
//! Loads configuration from environment variables.

use anyhow::Result;
use std::env;
use std::time::Duration;

use crate::provider::ProviderKind;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,

    /// Which voice-AI provider adapter to construct at startup.
    pub provider: ProviderKind,
    /// Env var name holding the provider API key (resolved lazily by the adapter).
    pub provider_api_key_env: String,

    /// Search provider base URL (HTTP).
    pub search_provider_url: Option<String>,
    /// Env var name holding the search provider API key.
    pub search_api_key_env: String,

    /// Summarization LLM base URL (HTTP).
    pub summary_llm_url: Option<String>,
    /// Env var name holding the summarization LLM API key.
    pub summary_api_key_env: String,

    /// Room capacity bounds.
    pub min_max_participants: u32,
    pub max_max_participants: u32,
    pub default_max_participants: u32,

    /// Presence debounce window.
    pub presence_debounce: Duration,
    /// Heartbeat interval / idle multiplier.
    pub heartbeat_interval: Duration,
    pub idle_after_missed_heartbeats: u32,

    /// Turn queue.
    pub turn_queue_max_size: usize,
    pub turn_default_timeout: Duration,
    pub turn_priority_timeout: Duration,
    pub turn_priority_bonus: i64,
    pub turn_min_interval: Duration,
    pub turn_max_processing_attempts: u32,

    /// Interrupts.
    pub interrupt_cooldown: Duration,
    pub interrupt_max_per_minute: u32,

    /// Mixed-audio input.
    pub audio_target_sample_rate: u32,
    pub audio_target_output_level: f32,
    pub audio_noise_gate_threshold: f32,
    pub audio_prefix_padding: Duration,
    pub audio_silence_duration: Duration,
    pub audio_energy_threshold: f32,
    pub audio_speech_threshold: f32,
    /// Expected inbound chunk duration, used to size the VAD prefix buffer
    /// and silence debounce in chunk units.
    pub audio_chunk_ms: u32,
    /// Sample rate of the mono PCM16 audio clients send over `audio_data`.
    pub audio_input_sample_rate: u32,

    /// Transcript ring capacity per room.
    pub max_entries_per_room: usize,

    /// Summarization triggers.
    pub summary_entry_threshold: usize,
    pub summary_time_threshold: Duration,
    pub summary_tick_interval: Duration,

    /// Timeouts (spec.md §5).
    pub provider_connect_timeout: Duration,
    pub tool_call_timeout: Duration,
    pub join_timeout: Duration,
    pub summary_llm_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            provider: env::var("VOICE_PROVIDER")
                .ok()
                .and_then(|v| ProviderKind::parse(&v))
                .unwrap_or(ProviderKind::RealtimeWs),
            provider_api_key_env: env::var("PROVIDER_API_KEY_ENV")
                .unwrap_or_else(|_| "VOICE_PROVIDER_API_KEY".into()),
            search_provider_url: env::var("SEARCH_PROVIDER_URL").ok(),
            search_api_key_env: env::var("SEARCH_API_KEY_ENV")
                .unwrap_or_else(|_| "SEARCH_API_KEY".into()),
            summary_llm_url: env::var("SUMMARY_LLM_URL").ok(),
            summary_api_key_env: env::var("SUMMARY_API_KEY_ENV")
                .unwrap_or_else(|_| "SUMMARY_LLM_API_KEY".into()),
            min_max_participants: 2,
            max_max_participants: 10,
            default_max_participants: env::var("DEFAULT_MAX_PARTICIPANTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6),
            presence_debounce: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            idle_after_missed_heartbeats: 3,
            turn_queue_max_size: 20,
            turn_default_timeout: Duration::from_secs(30),
            turn_priority_timeout: Duration::from_secs(60),
            turn_priority_bonus: 100,
            turn_min_interval: Duration::from_millis(500),
            turn_max_processing_attempts: 3,
            interrupt_cooldown: env::var("INTERRUPT_COOLDOWN_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(2000)),
            interrupt_max_per_minute: env::var("INTERRUPT_MAX_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            audio_target_sample_rate: 24_000,
            audio_target_output_level: 0.7,
            audio_noise_gate_threshold: 0.01,
            audio_prefix_padding: Duration::from_millis(300),
            audio_silence_duration: Duration::from_millis(500),
            audio_energy_threshold: env::var("VAD_ENERGY_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.02),
            audio_speech_threshold: env::var("VAD_SPEECH_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.5),
            audio_chunk_ms: 20,
            audio_input_sample_rate: env::var("AUDIO_INPUT_SAMPLE_RATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(48_000),
            max_entries_per_room: 10_000,
            summary_entry_threshold: env::var("SUMMARY_ENTRY_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            summary_time_threshold: env::var("SUMMARY_TIME_THRESHOLD_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or_else(|| Duration::from_secs(600)),
            summary_tick_interval: Duration::from_secs(30),
            provider_connect_timeout: Duration::from_secs(10),
            tool_call_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(5),
            summary_llm_timeout: Duration::from_secs(30),
        })
    }

    /// Create a default configuration for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".into(),
            provider: ProviderKind::Mock,
            provider_api_key_env: "VOICE_PROVIDER_API_KEY".into(),
            search_provider_url: None,
            search_api_key_env: "SEARCH_API_KEY".into(),
            summary_llm_url: None,
            summary_api_key_env: "SUMMARY_LLM_API_KEY".into(),
            min_max_participants: 2,
            max_max_participants: 10,
            default_max_participants: 6,
            presence_debounce: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            idle_after_missed_heartbeats: 3,
            turn_queue_max_size: 20,
            turn_default_timeout: Duration::from_secs(30),
            turn_priority_timeout: Duration::from_secs(60),
            turn_priority_bonus: 100,
            turn_min_interval: Duration::from_millis(500),
            turn_max_processing_attempts: 3,
            interrupt_cooldown: Duration::from_millis(2000),
            interrupt_max_per_minute: 10,
            audio_target_sample_rate: 24_000,
            audio_target_output_level: 0.7,
            audio_noise_gate_threshold: 0.01,
            audio_prefix_padding: Duration::from_millis(300),
            audio_silence_duration: Duration::from_millis(500),
            audio_energy_threshold: 0.02,
            audio_speech_threshold: 0.5,
            audio_chunk_ms: 20,
            audio_input_sample_rate: 48_000,
            max_entries_per_room: 10_000,
            summary_entry_threshold: 30,
            summary_time_threshold: Duration::from_secs(600),
            summary_tick_interval: Duration::from_secs(30),
            provider_connect_timeout: Duration::from_secs(10),
            tool_call_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(5),
            summary_llm_timeout: Duration::from_secs(30),
        }
    }
}
