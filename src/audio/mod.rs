//! Mixed-Audio Input (spec.md §4.8): bridges peer audio into the AI
//! Orchestrator through downmix, resample, gain/gate, and VAD-gated
//! forwarding with prefix padding and silence debounce.

use std::collections::{HashMap, VecDeque};

use base64::Engine;

use crate::room::{PeerId, RoomId};

/// Decode a little-endian PCM16 base64 frame into `[-1, 1]`-normalized
/// `f32` samples. Malformed input (non-base64, odd byte length) decodes to
/// an empty chunk rather than erroring, since a single dropped frame is
/// harmless and the caller has no synchronous way to report it back.
#[must_use]
pub fn decode_pcm16_base64(data: &str) -> Vec<f32> {
    let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(data) else {
        return Vec::new();
    };
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
        .collect()
}

/// Inverse of [`decode_pcm16_base64`]: re-encode gated `f32` samples back
/// into little-endian PCM16 base64 for [`crate::provider::VoiceProviderAdapter::send_audio`].
#[must_use]
pub fn encode_pcm16_base64(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        let i = (clamped * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&i.to_le_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Knobs driving the transform pipeline and VAD (spec.md §4.8, defaults
/// mirrored from [`crate::config::Config`]).
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub target_sample_rate: u32,
    pub target_output_level: f32,
    pub noise_gate_threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub energy_threshold: f32,
    pub speech_threshold: f32,
}

const MAX_GAIN: f32 = 3.0;

/// Downmix stereo (interleaved L/R `f32` samples) to mono by arithmetic
/// mean. A mono input passes through unchanged.
#[must_use]
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resample from `src_rate` to `dst_rate`.
#[must_use]
pub fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos.floor() as usize;
        let frac = (src_pos - idx as f64) as f32;
        let a = samples.get(idx).copied().unwrap_or(0.0);
        let b = samples.get(idx + 1).copied().unwrap_or(a);
        out.push(a + (b - a) * frac);
    }
    out
}

/// RMS of a sample chunk, assuming samples are normalized to [-1, 1].
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Normalize to `target_output_level`, gain capped at `MAX_GAIN`, then zero
/// samples below `noise_gate_threshold` (spec.md §4.8).
#[must_use]
pub fn normalize_and_gate(samples: &[f32], target_output_level: f32, noise_gate_threshold: f32) -> Vec<f32> {
    let level = rms(samples);
    let gain = if level > 0.0 { (target_output_level / level).min(MAX_GAIN) } else { 1.0 };
    let gate = noise_gate_threshold;
    samples
        .iter()
        .map(|s| {
            let g = s * gain;
            if g.abs() < gate { 0.0 } else { g }
        })
        .collect()
}

/// Applies the full transform chain: downmix, resample, normalize+gate.
#[must_use]
pub fn transform_chunk(samples: &[f32], channels: u16, src_rate: u32, cfg: &AudioConfig) -> Vec<f32> {
    let mono = downmix_to_mono(samples, channels);
    let resampled = resample_linear(&mono, src_rate, cfg.target_sample_rate);
    normalize_and_gate(&resampled, cfg.target_output_level, cfg.noise_gate_threshold)
}

/// `speechProbability = min(1, rms / (2 * energyThreshold))`; speech iff
/// `rms > energyThreshold AND speechProbability > speechThreshold`.
#[must_use]
pub fn is_speech(samples: &[f32], energy_threshold: f32, speech_threshold: f32) -> bool {
    let level = rms(samples);
    let probability = if energy_threshold > 0.0 { (level / (2.0 * energy_threshold)).min(1.0) } else { 1.0 };
    level > energy_threshold && probability > speech_threshold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VadState {
    Silence,
    Speech,
}

struct PeerVad {
    state: VadState,
    prefix_buffer: VecDeque<Vec<f32>>,
    prefix_buffer_samples: usize,
    silence_run_ms: u32,
}

impl PeerVad {
    fn new() -> Self {
        Self { state: VadState::Silence, prefix_buffer: VecDeque::new(), prefix_buffer_samples: 0, silence_run_ms: 0 }
    }
}

/// What an ingested chunk produced, after downmix/resample/gate/VAD, for the
/// caller to forward to [`crate::ai::AiOrchestrator::on_audio_data`].
#[derive(Debug, Clone, PartialEq)]
pub enum VadOutcome {
    /// Silence continues; nothing forwarded.
    Dropped,
    /// Silence→speech transition: prefix-padding chunks followed by the
    /// current chunk, all to be forwarded in order.
    SpeechStart(Vec<Vec<f32>>),
    /// Mid-speech chunk, forwarded as-is.
    Continue(Vec<f32>),
    /// Speech→silence after `silence_duration_ms` of uninterrupted silence.
    SpeechEnd,
}

/// Per-room, per-peer VAD/prefix-padding/debounce state plus the
/// empty-room drop policy (spec.md §4.8).
pub struct MixedAudioInput {
    cfg: AudioConfig,
    chunk_ms: u32,
    peers: HashMap<(RoomId, PeerId), PeerVad>,
    occupied_rooms: HashMap<RoomId, usize>,
}

impl MixedAudioInput {
    #[must_use]
    pub fn new(cfg: AudioConfig, chunk_ms: u32) -> Self {
        Self { cfg, chunk_ms, peers: HashMap::new(), occupied_rooms: HashMap::new() }
    }

    /// Non-AI peer joined the room; re-enables ingestion once the room is
    /// no longer empty, returning `true` on the empty→non-empty edge (the
    /// caller should emit `onRoomOccupied`).
    pub fn peer_joined(&mut self, room_id: &str) -> bool {
        let count = self.occupied_rooms.entry(room_id.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    pub fn peer_left(&mut self, room_id: &str, peer_id: PeerId) {
        if let Some(count) = self.occupied_rooms.get_mut(room_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.occupied_rooms.remove(room_id);
            }
        }
        self.peers.remove(&(room_id.to_string(), peer_id));
    }

    #[must_use]
    pub fn is_room_occupied(&self, room_id: &str) -> bool {
        self.occupied_rooms.get(room_id).is_some_and(|c| *c > 0)
    }

    /// Ingest one raw chunk (already downmixed/resampled/gated by the
    /// caller via [`transform_chunk`]), running the VAD state machine.
    /// Empty rooms drop audio at ingress regardless of VAD state.
    pub fn ingest(&mut self, room_id: &str, peer_id: PeerId, gated: Vec<f32>) -> VadOutcome {
        if !self.is_room_occupied(room_id) {
            return VadOutcome::Dropped;
        }

        let speech_now = is_speech(&gated, self.cfg.energy_threshold, self.cfg.speech_threshold);
        let key = (room_id.to_string(), peer_id);
        let vad = self.peers.entry(key).or_insert_with(PeerVad::new);

        match vad.state {
            VadState::Silence if speech_now => {
                vad.state = VadState::Speech;
                vad.silence_run_ms = 0;
                let mut prefix: Vec<Vec<f32>> = vad.prefix_buffer.drain(..).collect();
                vad.prefix_buffer_samples = 0;
                prefix.push(gated);
                VadOutcome::SpeechStart(prefix)
            }
            VadState::Silence => {
                vad.prefix_buffer.push_back(gated);
                vad.prefix_buffer_samples += self.chunk_ms as usize;
                while vad.prefix_buffer_samples > self.cfg.prefix_padding_ms as usize {
                    if let Some(dropped) = vad.prefix_buffer.pop_front() {
                        vad.prefix_buffer_samples -= self.chunk_ms as usize;
                        drop(dropped);
                    } else {
                        break;
                    }
                }
                VadOutcome::Dropped
            }
            VadState::Speech if speech_now => {
                vad.silence_run_ms = 0;
                VadOutcome::Continue(gated)
            }
            VadState::Speech => {
                vad.silence_run_ms += self.chunk_ms;
                if vad.silence_run_ms >= self.cfg.silence_duration_ms {
                    vad.state = VadState::Silence;
                    vad.silence_run_ms = 0;
                    VadOutcome::SpeechEnd
                } else {
                    // Still within the debounce window; keep forwarding as speech.
                    VadOutcome::Continue(gated)
                }
            }
        }
    }

    pub fn remove_room(&mut self, room_id: &str) {
        self.occupied_rooms.remove(room_id);
        self.peers.retain(|(r, _), _| r != room_id);
    }

    /// Full ingress path for one `audio_data` wire frame: decode, run the
    /// transform chain, gate through VAD, and re-encode whatever should be
    /// forwarded to the provider as PCM16 base64 (spec.md §4.5 "forward to
    /// provider after VAD gating (C8)").
    pub fn ingest_wire_frame(
        &mut self,
        room_id: &str,
        peer_id: PeerId,
        pcm_base64: &str,
        src_sample_rate: u32,
        channels: u16,
    ) -> Vec<String> {
        let raw = decode_pcm16_base64(pcm_base64);
        let gated = transform_chunk(&raw, channels, src_sample_rate, &self.cfg);
        match self.ingest(room_id, peer_id, gated) {
            VadOutcome::Dropped | VadOutcome::SpeechEnd => Vec::new(),
            VadOutcome::Continue(chunk) => vec![encode_pcm16_base64(&chunk)],
            VadOutcome::SpeechStart(chunks) => chunks.iter().map(|c| encode_pcm16_base64(c)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AudioConfig {
        AudioConfig {
            target_sample_rate: 24_000,
            target_output_level: 0.7,
            noise_gate_threshold: 0.0,
            prefix_padding_ms: 60,
            silence_duration_ms: 100,
            energy_threshold: 0.02,
            speech_threshold: 0.5,
        }
    }

    fn loud_chunk() -> Vec<f32> {
        vec![0.5; 160]
    }

    fn silent_chunk() -> Vec<f32> {
        vec![0.0; 160]
    }

    #[test]
    fn downmix_averages_stereo_channels() {
        let stereo = vec![1.0, 0.0, 0.5, 0.5];
        let mono = downmix_to_mono(&stereo, 2);
        assert_eq!(mono, vec![0.5, 0.5]);
    }

    #[test]
    fn speech_boundary_is_strict_greater_than() {
        // rms exactly at the threshold must not count as speech.
        let samples = vec![0.02; 10];
        assert!(!is_speech(&samples, 0.02, 0.0));
    }

    #[test]
    fn empty_room_drops_audio_at_ingress() {
        let mut input = MixedAudioInput::new(cfg(), 20);
        let outcome = input.ingest("r1", PeerId::new_v4(), loud_chunk());
        assert_eq!(outcome, VadOutcome::Dropped);
    }

    #[test]
    fn silence_to_speech_flushes_prefix_then_current_chunk() {
        let mut input = MixedAudioInput::new(cfg(), 20);
        input.peer_joined("r1");
        let peer = PeerId::new_v4();

        input.ingest("r1", peer, silent_chunk());
        input.ingest("r1", peer, silent_chunk());
        let outcome = input.ingest("r1", peer, loud_chunk());
        match outcome {
            VadOutcome::SpeechStart(chunks) => assert_eq!(chunks.len(), 3),
            other => panic!("expected SpeechStart, got {other:?}"),
        }
    }

    #[test]
    fn speech_to_silence_requires_full_debounce_window() {
        let mut input = MixedAudioInput::new(cfg(), 20);
        input.peer_joined("r1");
        let peer = PeerId::new_v4();

        input.ingest("r1", peer, loud_chunk());
        // 20ms < 100ms debounce: still counts as Continue, not SpeechEnd.
        let mid = input.ingest("r1", peer, silent_chunk());
        assert!(matches!(mid, VadOutcome::Continue(_)));

        // 3 more silent chunks (40, 60, 80ms) still within the window...
        for _ in 0..3 {
            let outcome = input.ingest("r1", peer, silent_chunk());
            assert!(matches!(outcome, VadOutcome::Continue(_)));
        }
        // ...the 5th silent chunk reaches the 100ms debounce threshold.
        let end = input.ingest("r1", peer, silent_chunk());
        assert_eq!(end, VadOutcome::SpeechEnd);
    }

    #[test]
    fn room_occupied_edge_fires_once() {
        let mut input = MixedAudioInput::new(cfg(), 20);
        assert!(input.peer_joined("r1"));
        assert!(!input.peer_joined("r1"));
    }

    #[test]
    fn pcm16_base64_round_trips_within_quantization_error() {
        let samples = vec![-0.5_f32, 0.0, 0.25, 0.999];
        let encoded = encode_pcm16_base64(&samples);
        let decoded = decode_pcm16_base64(&encoded);
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 0.001);
        }
    }

    #[test]
    fn malformed_base64_decodes_to_empty_rather_than_panicking() {
        assert!(decode_pcm16_base64("not valid base64!!").is_empty());
    }
}
