use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::animation::{AnimationState, TriggerSet, VisualTarget, DEFAULT_ATTACK_FRACTION};
use crate::binding::{presets, AnimationBindingFactory};
use crate::clock::{Phase, Tempo};
use crate::{BeatSyncError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub bindings: Vec<BindingConfig>,
}

impl AppConfig {
    /// Reads a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// The kick/snare/logo trio at the default tempo.
    pub fn demo() -> Self {
        let binding = |name: &str, animation| BindingConfig {
            name: name.to_string(),
            tempo_bpm: None,
            animation,
        };
        Self {
            scheduler: SchedulerConfig::default(),
            bindings: vec![
                binding("background", BindingSource::Kick),
                binding("headline", BindingSource::Snare),
                binding("logo", BindingSource::Logo),
            ],
        }
    }

    /// Checks every value that would otherwise only fail once the scheduler
    /// or a binding is built.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        for binding in &self.bindings {
            binding.factory(&self.scheduler).map_err(|err| {
                BeatSyncError::msg(format!("binding `{}`: {err}", binding.name))
            })?;
        }
        Ok(())
    }
}

/// Settings of the shared clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tempo_bpm: f64,
    /// Default share of a tick spent on the attack.
    pub attack_fraction: f64,
    /// Upper bound on how long the real-time driver sleeps between frames.
    pub frame_interval_ms: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tempo_bpm: 120.0,
            attack_fraction: DEFAULT_ATTACK_FRACTION,
            frame_interval_ms: 16.0,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        Tempo::from_bpm(self.tempo_bpm)?;
        if !(self.attack_fraction > 0.0 && self.attack_fraction < 1.0) {
            return Err(BeatSyncError::InvalidAttackFraction(self.attack_fraction));
        }
        if !(self.frame_interval_ms.is_finite() && self.frame_interval_ms > 0.0) {
            return Err(BeatSyncError::msg(format!(
                "frame interval must be positive (got {})",
                self.frame_interval_ms
            )));
        }
        Ok(())
    }
}

/// A named binding and the animation it plays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    pub name: String,
    /// Falls back to the scheduler tempo.
    #[serde(default)]
    pub tempo_bpm: Option<f64>,
    pub animation: BindingSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindingSource {
    Kick,
    Snare,
    Logo,
    Pulse {
        phase: Phase,
        attack: VisualTarget,
        release: VisualTarget,
    },
    Custom {
        attack: AnimationState,
        release: AnimationState,
        trigger_phases: TriggerSet,
        #[serde(default)]
        phase_attacks: Vec<PhaseAttack>,
    },
}

/// Attack properties that only apply when triggered by `phase`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseAttack {
    pub phase: Phase,
    pub target: VisualTarget,
}

impl BindingConfig {
    /// Builds the factory, applying the scheduler-wide attack fraction.
    pub fn factory(&self, scheduler: &SchedulerConfig) -> Result<AnimationBindingFactory> {
        let tempo = self.tempo_bpm.unwrap_or(scheduler.tempo_bpm);
        let factory = match &self.animation {
            BindingSource::Kick => presets::kick(tempo)?,
            BindingSource::Snare => presets::snare(tempo)?,
            BindingSource::Logo => presets::logo(tempo)?,
            BindingSource::Pulse {
                phase,
                attack,
                release,
            } => presets::pulse_on(*phase, attack.clone(), release.clone(), tempo)?,
            BindingSource::Custom {
                attack,
                release,
                trigger_phases,
                phase_attacks,
            } => phase_attacks.iter().fold(
                AnimationBindingFactory::new(
                    attack.clone(),
                    release.clone(),
                    *trigger_phases,
                    tempo,
                )?,
                |factory, extra| factory.with_phase_attack(extra.phase, extra.target.clone()),
            ),
        };
        factory.with_attack_fraction(scheduler.attack_fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUSTOM: &str = r#"{
        "scheduler": { "tempo_bpm": 90 },
        "bindings": [
            {
                "name": "glow",
                "animation": {
                    "kind": "custom",
                    "attack": {
                        "target": { "scale": 1.02, "textShadow": "0 0 25px blue" },
                        "motion": { "type": "tween", "ease": [0.33, 1, 0.68, 1] }
                    },
                    "release": {
                        "target": { "scale": 1 },
                        "motion": { "type": "spring", "stiffness": 200, "damping": 25 }
                    },
                    "trigger_phases": [1, 3],
                    "phase_attacks": [{ "phase": 3, "target": { "rotate": -3 } }]
                }
            },
            { "name": "card", "tempo_bpm": 60, "animation": { "kind": "pulse", "phase": 2, "attack": { "y": -3 }, "release": { "y": 0 } } },
            { "name": "bg", "animation": { "kind": "kick" } }
        ]
    }"#;

    #[test]
    fn parses_custom_and_preset_bindings() {
        let config = AppConfig::from_json_str(CUSTOM).unwrap();
        assert_eq!(config.scheduler.tempo_bpm, 90.0);
        assert_eq!(config.scheduler.attack_fraction, DEFAULT_ATTACK_FRACTION);
        assert_eq!(config.bindings.len(), 3);

        let glow = config.bindings[0].factory(&config.scheduler).unwrap();
        assert_eq!(glow.plan().triggers, TriggerSet::backbeat());
        assert_eq!(glow.plan().tempo.bpm(), 90.0);
        assert_eq!(glow.plan().phase_attacks.len(), 1);

        let card = config.bindings[1].factory(&config.scheduler).unwrap();
        assert_eq!(card.plan().tempo.bpm(), 60.0);
        assert_eq!(Vec::<u8>::from(card.plan().triggers), vec![2]);
    }

    #[test]
    fn rejects_bad_values_up_front() {
        let bad_tempo = r#"{ "scheduler": { "tempo_bpm": 0 } }"#;
        assert!(matches!(
            AppConfig::from_json_str(bad_tempo),
            Err(BeatSyncError::InvalidTempo(_))
        ));

        let bad_phase = r#"{ "bindings": [{ "name": "x", "animation": { "kind": "pulse", "phase": 4, "attack": {}, "release": {} } }] }"#;
        assert!(AppConfig::from_json_str(bad_phase).is_err());

        let bad_binding_tempo =
            r#"{ "bindings": [{ "name": "slow", "tempo_bpm": -5, "animation": { "kind": "snare" } }] }"#;
        let err = AppConfig::from_json_str(bad_binding_tempo).unwrap_err();
        assert!(format!("{err}").contains("slow"));
    }

    #[test]
    fn demo_config_is_valid() {
        let config = AppConfig::demo();
        config.validate().unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back = AppConfig::from_json_str(&json).unwrap();
        assert_eq!(back.bindings.len(), 3);
    }

    #[test]
    fn missing_file_surfaces_io_error() {
        let err = AppConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, BeatSyncError::Io(_)));
    }
}
