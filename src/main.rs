//! Room Coordination Engine - Main Entry Point
//!
//! Real-time multi-party voice collaboration server.

use anyhow::Result;
use room_coordination_engine::ai::{AiOrchestrator, DeferredBroadcaster};
use room_coordination_engine::api::{self, AppState};
use room_coordination_engine::audio::{AudioConfig, MixedAudioInput};
use room_coordination_engine::config::Config;
use room_coordination_engine::interrupt::{InterruptConfig, InterruptHandler};
use room_coordination_engine::presence::PresenceTracker;
use room_coordination_engine::provider::build_adapter;
use room_coordination_engine::ratelimit::RateLimiter;
use room_coordination_engine::room::RoomStore;
use room_coordination_engine::search::SearchBridge;
use room_coordination_engine::signaling::SignalingHub;
use room_coordination_engine::summarization::SummarizationService;
use room_coordination_engine::transcript::ContextManager;
use room_coordination_engine::turn_queue::TurnQueueProcessor;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "room_coordination_engine=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Room Coordination Engine");

    let room_store = Arc::new(RoomStore::new(
        config.min_max_participants,
        config.max_max_participants,
        config.default_max_participants,
    ));
    let context = Arc::new(ContextManager::new(config.max_entries_per_room));
    let turn_queue = Arc::new(TurnQueueProcessor::new(
        config.turn_queue_max_size,
        config.turn_default_timeout,
        config.turn_priority_timeout,
        config.turn_priority_bonus,
        config.turn_min_interval,
        config.turn_max_processing_attempts,
    ));
    let presence = Arc::new(PresenceTracker::new(config.presence_debounce));
    let interrupt = Arc::new(InterruptHandler::new(
        room_store.clone(),
        InterruptConfig {
            cooldown: config.interrupt_cooldown,
            max_per_minute: config.interrupt_max_per_minute,
            ..InterruptConfig::default()
        },
    ));

    let search = Arc::new(SearchBridge::new(
        config.search_provider_url.clone(),
        env::var(&config.search_api_key_env).ok(),
    ));

    let provider_api_key = env::var(&config.provider_api_key_env).ok();
    let adapter = build_adapter(
        config.provider,
        env::var("VOICE_PROVIDER_WS_URL").ok(),
        env::var("VOICE_PROVIDER_HTTP_URL").ok(),
        provider_api_key,
    );

    let summarization = Arc::new(SummarizationService::new(
        config.summary_llm_url.clone(),
        env::var(&config.summary_api_key_env).ok(),
        context.clone(),
        room_store.clone(),
        config.summary_entry_threshold,
        config.summary_time_threshold,
        config.summary_llm_timeout,
    ));

    // `AiOrchestrator` needs a `Broadcaster` (the Signaling Hub) that in turn
    // needs the orchestrator itself; bootstrap through a deferred cell and
    // bind it once the hub exists.
    let deferred_broadcaster = Arc::new(DeferredBroadcaster::new());
    let ai = Arc::new(AiOrchestrator::new(
        adapter,
        context.clone(),
        turn_queue.clone(),
        deferred_broadcaster.clone(),
        search.clone(),
        summarization.clone(),
        config.tool_call_timeout,
    ));

    let audio = MixedAudioInput::new(
        AudioConfig {
            target_sample_rate: config.audio_target_sample_rate,
            target_output_level: config.audio_target_output_level,
            noise_gate_threshold: config.audio_noise_gate_threshold,
            prefix_padding_ms: config.audio_prefix_padding.as_millis() as u32,
            silence_duration_ms: config.audio_silence_duration.as_millis() as u32,
            energy_threshold: config.audio_energy_threshold,
            speech_threshold: config.audio_speech_threshold,
        },
        config.audio_chunk_ms,
    );
    let signaling = Arc::new(SignalingHub::new(
        room_store.clone(),
        presence.clone(),
        turn_queue.clone(),
        ai.clone(),
        interrupt.clone(),
        context.clone(),
        audio,
        config.audio_input_sample_rate,
    ));
    deferred_broadcaster.bind(signaling.clone());

    let state = AppState {
        config: Arc::new(config.clone()),
        room_store: room_store.clone(),
        signaling: signaling.clone(),
        ai,
        context,
        turn_queue,
        presence,
        interrupt,
        summarization: summarization.clone(),
        search,
        connect_limiter: Arc::new(RateLimiter::new(Duration::from_millis(200))),
    };

    tokio::spawn({
        let summarization = summarization.clone();
        async move { summarization.run_ticker(config.summary_tick_interval).await }
    });

    let idle_after = chrono::Duration::from_std(
        config.heartbeat_interval * config.idle_after_missed_heartbeats,
    )
    .unwrap_or_else(|_| chrono::Duration::seconds(90));
    tokio::spawn(api::run_idle_sweep(state.clone(), Duration::from_secs(30), idle_after));

    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Server listening");

    let shutdown_signal = async {
        tokio::signal::ctrl_c().await.expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Server shutdown complete");
    Ok(())
}
