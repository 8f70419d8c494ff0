//! Ready-made factories for the common beat effects.
//!
//! The visual values are defaults only; callers wanting other looks build
//! their own [`AnimationBindingFactory`].

use crate::animation::{AnimationState, TriggerSet, VisualTarget};
use crate::clock::Phase;
use crate::Result;

use super::AnimationBindingFactory;

/// Pulses on every phase.
pub fn every_phase(
    attack: VisualTarget,
    release: VisualTarget,
    tempo_bpm: f64,
) -> Result<AnimationBindingFactory> {
    AnimationBindingFactory::new(
        AnimationState::attack(attack),
        AnimationState::release(release),
        TriggerSet::every_phase(),
        tempo_bpm,
    )
}

/// Pulses on phases 1 and 3.
pub fn backbeat(
    attack: VisualTarget,
    release: VisualTarget,
    tempo_bpm: f64,
) -> Result<AnimationBindingFactory> {
    AnimationBindingFactory::new(
        AnimationState::attack(attack),
        AnimationState::release(release),
        TriggerSet::backbeat(),
        tempo_bpm,
    )
}

/// Pulses on a single phase, e.g. to alternate neighbouring cards.
pub fn pulse_on(
    phase: Phase,
    attack: VisualTarget,
    release: VisualTarget,
    tempo_bpm: f64,
) -> Result<AnimationBindingFactory> {
    AnimationBindingFactory::new(
        AnimationState::attack(attack),
        AnimationState::release(release),
        TriggerSet::only(phase),
        tempo_bpm,
    )
}

/// Kick drum: a quick vertical expansion on every phase.
pub fn kick(tempo_bpm: f64) -> Result<AnimationBindingFactory> {
    every_phase(
        VisualTarget::new().with("height", 1250.0).with("y", -10.0),
        VisualTarget::new().with("height", 1100.0).with("y", 0.0),
        tempo_bpm,
    )
}

/// Snare: scale and chromatic split on the backbeat.
pub fn snare(tempo_bpm: f64) -> Result<AnimationBindingFactory> {
    backbeat(
        VisualTarget::new()
            .with("scale", 1.05)
            .with("filter", "brightness(1.3) contrast(1.2)")
            .with(
                "textShadow",
                "3px 0 0 rgba(255,0,0,0.85), -3px 0 0 rgba(0,255,255,0.85), 0 2px 0 rgba(0,255,0,0.6)",
            ),
        VisualTarget::new()
            .with("scale", 1.0)
            .with("filter", "brightness(1) contrast(1)")
            .with("textShadow", "0 0 0 rgba(0,0,0,0)"),
        tempo_bpm,
    )
}

/// Logo: snare timing with a tilt that alternates direction between the two
/// backbeats.
pub fn logo(tempo_bpm: f64) -> Result<AnimationBindingFactory> {
    let factory = backbeat(
        VisualTarget::new()
            .with("scale", 1.08)
            .with("filter", "brightness(1.2) contrast(1.1)"),
        VisualTarget::new()
            .with("scale", 1.0)
            .with("rotate", 0.0)
            .with("filter", "brightness(1) contrast(1)"),
        tempo_bpm,
    )?;
    Ok(factory
        .with_phase_attack(Phase::new(1)?, VisualTarget::new().with("rotate", 3.0))
        .with_phase_attack(Phase::new(3)?, VisualTarget::new().with("rotate", -3.0)))
}
