//! The per-room AI state machine (spec.md §4.5 `RoomAIState`), expressed as
//! an `apply`-style transition function in the teacher's `CallState::apply`
//! idiom.

use serde::Serialize;
use thiserror::Error;

use crate::room::PeerId;
use crate::turn_queue::TurnRequest;

/// The five legal states of a room's AI session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AiState {
    Idle,
    Listening,
    Processing,
    Speaking,
    /// Entered instead of `Idle` when an interrupt is accepted while
    /// `lock_during_response` is set and the outbound audio pipeline is
    /// still draining; returns to `Idle` once draining finishes.
    Locked,
}

/// Events that drive the state machine (spec.md §4.5 transition table).
#[derive(Debug, Clone)]
pub enum AiEvent {
    TurnGranted { peer_id: PeerId, name: String },
    AudioDataInbound,
    PttEnd,
    ProviderAudioDelta,
    ProviderResponseDone,
    InterruptAccepted { lock_during_response: bool, draining: bool },
    DrainComplete,
    ProviderError { message: String },
    SessionReconnectOk,
}

#[derive(Debug, Error)]
pub enum AiStateError {
    #[error("invalid transition: {event} while {state:?}")]
    InvalidTransition { state: AiState, event: &'static str },
}

/// Full per-room AI state, including the fields broadcast as `ai:state`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAiState {
    pub state: AiState,
    pub active_speaker_id: Option<PeerId>,
    pub active_speaker_name: Option<String>,
    pub is_session_healthy: bool,
    pub last_error: Option<String>,
    pub queue: Vec<TurnRequest>,
}

impl RoomAiState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AiState::Idle,
            active_speaker_id: None,
            active_speaker_name: None,
            is_session_healthy: true,
            last_error: None,
            queue: Vec::new(),
        }
    }

    /// Apply one event, returning the new state or the specific illegal
    /// transition that was attempted.
    pub fn apply(mut self, event: AiEvent) -> Result<Self, AiStateError> {
        self.state = match (self.state, &event) {
            (AiState::Idle, AiEvent::TurnGranted { peer_id, name }) => {
                self.active_speaker_id = Some(*peer_id);
                self.active_speaker_name = Some(name.clone());
                AiState::Listening
            }
            (AiState::Listening, AiEvent::AudioDataInbound) => AiState::Listening,
            (AiState::Listening, AiEvent::PttEnd) => AiState::Processing,
            (AiState::Processing, AiEvent::ProviderAudioDelta) => AiState::Speaking,
            (AiState::Speaking, AiEvent::ProviderAudioDelta) => AiState::Speaking,
            (AiState::Speaking, AiEvent::ProviderResponseDone) => {
                self.active_speaker_id = None;
                self.active_speaker_name = None;
                AiState::Idle
            }
            (
                AiState::Listening | AiState::Processing | AiState::Speaking | AiState::Locked,
                AiEvent::InterruptAccepted { lock_during_response, draining },
            ) => {
                if *lock_during_response && *draining {
                    AiState::Locked
                } else {
                    self.active_speaker_id = None;
                    self.active_speaker_name = None;
                    AiState::Idle
                }
            }
            (AiState::Locked, AiEvent::DrainComplete) => {
                self.active_speaker_id = None;
                self.active_speaker_name = None;
                AiState::Idle
            }
            (state, AiEvent::ProviderError { message }) => {
                self.is_session_healthy = false;
                self.last_error = Some(message.clone());
                if state == AiState::Idle {
                    AiState::Idle
                } else {
                    self.active_speaker_id = None;
                    self.active_speaker_name = None;
                    AiState::Idle
                }
            }
            (_, AiEvent::SessionReconnectOk) => {
                self.is_session_healthy = true;
                self.last_error = None;
                AiState::Idle
            }
            (state, event) => {
                return Err(AiStateError::InvalidTransition { state, event: event_name(event) });
            }
        };
        Ok(self)
    }
}

impl Default for RoomAiState {
    fn default() -> Self {
        Self::new()
    }
}

fn event_name(event: &AiEvent) -> &'static str {
    match event {
        AiEvent::TurnGranted { .. } => "turn_granted",
        AiEvent::AudioDataInbound => "audio_data",
        AiEvent::PttEnd => "ptt_end",
        AiEvent::ProviderAudioDelta => "provider_audio_delta",
        AiEvent::ProviderResponseDone => "provider_response_done",
        AiEvent::InterruptAccepted { .. } => "interrupt_accepted",
        AiEvent::DrainComplete => "drain_complete",
        AiEvent::ProviderError { .. } => "provider_error",
        AiEvent::SessionReconnectOk => "session_reconnect_ok",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_idle_to_speaking_to_idle() {
        let s = RoomAiState::new();
        let s = s
            .apply(AiEvent::TurnGranted { peer_id: PeerId::new_v4(), name: "Alice".into() })
            .unwrap();
        assert_eq!(s.state, AiState::Listening);
        let s = s.apply(AiEvent::PttEnd).unwrap();
        assert_eq!(s.state, AiState::Processing);
        let s = s.apply(AiEvent::ProviderAudioDelta).unwrap();
        assert_eq!(s.state, AiState::Speaking);
        let s = s.apply(AiEvent::ProviderResponseDone).unwrap();
        assert_eq!(s.state, AiState::Idle);
        assert!(s.active_speaker_id.is_none());
    }

    #[test]
    fn ptt_end_while_idle_is_rejected() {
        let s = RoomAiState::new();
        assert!(s.apply(AiEvent::PttEnd).is_err());
    }

    #[test]
    fn interrupt_during_drain_locks_instead_of_idle() {
        let s = RoomAiState::new();
        let s = s
            .apply(AiEvent::TurnGranted { peer_id: PeerId::new_v4(), name: "Alice".into() })
            .unwrap();
        let s = s.apply(AiEvent::PttEnd).unwrap();
        let s = s
            .apply(AiEvent::InterruptAccepted { lock_during_response: true, draining: true })
            .unwrap();
        assert_eq!(s.state, AiState::Locked);
        let s = s.apply(AiEvent::DrainComplete).unwrap();
        assert_eq!(s.state, AiState::Idle);
    }

    #[test]
    fn provider_error_marks_unhealthy_and_returns_to_idle() {
        let s = RoomAiState::new();
        let s = s
            .apply(AiEvent::TurnGranted { peer_id: PeerId::new_v4(), name: "Alice".into() })
            .unwrap();
        let s = s.apply(AiEvent::ProviderError { message: "boom".into() }).unwrap();
        assert_eq!(s.state, AiState::Idle);
        assert!(!s.is_session_healthy);
        assert_eq!(s.last_error.as_deref(), Some("boom"));

        let s = s.apply(AiEvent::SessionReconnectOk).unwrap();
        assert!(s.is_session_healthy);
        assert!(s.last_error.is_none());
    }
}
