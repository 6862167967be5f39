//! Personality Manager (spec.md §4.11): per-room system-instruction, voice
//! and temperature configuration.

use serde::{Deserialize, Serialize};

const MAX_CUSTOM_INSTRUCTIONS: usize = 4000;
const MAX_ADDITIONAL_CONTEXT: usize = 1000;
const DEFAULT_TEMPERATURE: f32 = 0.8;
const DEFAULT_VOICE: &str = "default";

/// Named AI personality presets, plus a fully custom mode (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Personality {
    #[default]
    Facilitator,
    Assistant,
    Expert,
    Brainstorm,
    Custom,
}

impl Personality {
    /// Preset base instructions; `Custom` has none (caller must supply
    /// `custom_instructions`).
    #[must_use]
    pub fn preset_instructions(self) -> &'static str {
        match self {
            Self::Facilitator => {
                "You are a neutral facilitator for this group conversation. Keep the \
                 discussion on track, summarize points of agreement, and invite quieter \
                 participants to contribute."
            }
            Self::Assistant => {
                "You are a helpful voice assistant for this group. Answer questions \
                 directly and concisely."
            }
            Self::Expert => {
                "You are a subject-matter expert joining this conversation to answer \
                 technical questions with precision and cite uncertainty where it exists."
            }
            Self::Brainstorm => {
                "You are a creative brainstorming partner. Generate and riff on ideas \
                 freely, building on what participants say rather than judging it."
            }
            Self::Custom => "",
        }
    }

    /// Suggested voice id for this preset, used when no explicit override
    /// is configured.
    #[must_use]
    pub fn suggested_voice(self) -> &'static str {
        match self {
            Self::Facilitator => "warm",
            Self::Assistant => "neutral",
            Self::Expert => "measured",
            Self::Brainstorm => "energetic",
            Self::Custom => DEFAULT_VOICE,
        }
    }

    /// Suggested temperature for this preset.
    #[must_use]
    pub fn suggested_temperature(self) -> f32 {
        match self {
            Self::Facilitator => 0.6,
            Self::Assistant => 0.5,
            Self::Expert => 0.3,
            Self::Brainstorm => 1.1,
            Self::Custom => DEFAULT_TEMPERATURE,
        }
    }
}

/// Per-room AI configuration (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAiConfig {
    pub personality: Personality,
    pub custom_instructions: Option<String>,
    pub voice: Option<String>,
    pub temperature: Option<f32>,
    pub additional_context: Option<String>,
    pub participant_context: Option<String>,
}

impl RoomAiConfig {
    /// Construct and validate a fresh config, e.g. from a room-creation
    /// request (spec.md §6 `POST /rooms`).
    pub fn new(personality: Personality, voice: Option<String>) -> Result<Self, String> {
        let mut cfg = Self {
            personality,
            custom_instructions: None,
            voice,
            temperature: None,
            additional_context: None,
            participant_context: None,
        };
        if personality == Personality::Custom {
            // A freshly created custom room starts with the assistant
            // fallback text until the owner supplies real instructions.
            cfg.custom_instructions = Some(Personality::Assistant.preset_instructions().to_string());
        }
        Ok(cfg)
    }

    /// `SetPersonality` (spec.md §4.11).
    pub fn set_personality(
        &mut self,
        personality: Personality,
        custom_instructions: Option<String>,
    ) -> Result<(), String> {
        if personality == Personality::Custom {
            let text = custom_instructions
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| "customInstructions required for custom personality".to_string())?;
            if text.len() > MAX_CUSTOM_INSTRUCTIONS {
                return Err(format!(
                    "customInstructions exceeds {MAX_CUSTOM_INSTRUCTIONS} characters"
                ));
            }
            self.custom_instructions = Some(text);
        }
        self.personality = personality;
        Ok(())
    }

    /// `SetTemperature` (spec.md §4.11).
    pub fn set_temperature(&mut self, temperature: f32) -> Result<(), String> {
        if !(0.0..=2.0).contains(&temperature) {
            return Err("temperature must be within [0, 2]".to_string());
        }
        self.temperature = Some(temperature);
        Ok(())
    }

    /// `SetAdditionalContext` (spec.md §4.11).
    pub fn set_additional_context(&mut self, context: Option<String>) -> Result<(), String> {
        if let Some(ref c) = context {
            if c.len() > MAX_ADDITIONAL_CONTEXT {
                return Err(format!(
                    "additionalContext exceeds {MAX_ADDITIONAL_CONTEXT} characters"
                ));
            }
        }
        self.additional_context = context;
        Ok(())
    }

    /// Effective voice: explicit override, else preset suggestion.
    #[must_use]
    pub fn effective_voice(&self) -> String {
        self.voice
            .clone()
            .unwrap_or_else(|| self.personality.suggested_voice().to_string())
    }

    /// Effective temperature: explicit override, else preset suggestion,
    /// else the global default.
    #[must_use]
    pub fn effective_temperature(&self) -> f32 {
        self.temperature
            .unwrap_or_else(|| self.personality.suggested_temperature())
    }

    /// `GenerateInstructions` (spec.md §4.11): base, then each extra block
    /// on its own paragraph.
    #[must_use]
    pub fn generate_instructions(&self) -> String {
        let mut out = if self.personality == Personality::Custom {
            self.custom_instructions.clone().unwrap_or_default()
        } else {
            self.personality.preset_instructions().to_string()
        };
        if let Some(ref ctx) = self.participant_context {
            if !ctx.is_empty() {
                out.push_str("\n\n");
                out.push_str(ctx);
            }
        }
        if let Some(ref ctx) = self.additional_context {
            if !ctx.is_empty() {
                out.push_str("\n\n");
                out.push_str(ctx);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_personality_requires_instructions() {
        let mut cfg = RoomAiConfig::new(Personality::Facilitator, None).unwrap();
        let err = cfg.set_personality(Personality::Custom, None).unwrap_err();
        assert!(err.contains("customInstructions"));
    }

    #[test]
    fn custom_instructions_length_enforced() {
        let mut cfg = RoomAiConfig::new(Personality::Facilitator, None).unwrap();
        let too_long = "x".repeat(4001);
        assert!(cfg.set_personality(Personality::Custom, Some(too_long)).is_err());
    }

    #[test]
    fn temperature_clamped_to_range() {
        let mut cfg = RoomAiConfig::new(Personality::Facilitator, None).unwrap();
        assert!(cfg.set_temperature(-0.1).is_err());
        assert!(cfg.set_temperature(2.1).is_err());
        assert!(cfg.set_temperature(1.5).is_ok());
    }

    #[test]
    fn generate_instructions_appends_context_blocks() {
        let mut cfg = RoomAiConfig::new(Personality::Assistant, None).unwrap();
        cfg.set_additional_context(Some("Extra context.".into())).unwrap();
        cfg.participant_context = Some("Participants: Alice, Bob.".into());
        let text = cfg.generate_instructions();
        assert!(text.contains("Participants: Alice, Bob."));
        assert!(text.contains("Extra context."));
        assert!(text.starts_with(Personality::Assistant.preset_instructions()));
    }

    #[test]
    fn voice_and_temperature_prefer_explicit_override() {
        let mut cfg = RoomAiConfig::new(Personality::Expert, None).unwrap();
        assert_eq!(cfg.effective_voice(), "measured");
        cfg.voice = Some("custom-voice".into());
        assert_eq!(cfg.effective_voice(), "custom-voice");

        assert!((cfg.effective_temperature() - 0.3).abs() < f32::EPSILON);
        cfg.set_temperature(1.9).unwrap();
        assert!((cfg.effective_temperature() - 1.9).abs() < f32::EPSILON);
    }
}
