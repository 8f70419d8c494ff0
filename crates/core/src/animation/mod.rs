use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::clock::{Phase, Tempo, PHASES_PER_CYCLE};
use crate::timeline::Millis;
use crate::{BeatSyncError, Result};

/// Portion of a tick spent on the attack when nothing else is configured.
pub const DEFAULT_ATTACK_FRACTION: f64 = 0.1;

/// Value of a single visual property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Property → value mapping the rendering layer animates towards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisualTarget {
    properties: BTreeMap<String, PropertyValue>,
}

impl VisualTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, property: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set(property, value);
        self
    }

    pub fn set(&mut self, property: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(property.into(), value.into());
    }

    pub fn get(&self, property: &str) -> Option<&PropertyValue> {
        self.properties.get(property)
    }

    pub fn number(&self, property: &str) -> Option<f64> {
        match self.get(property) {
            Some(PropertyValue::Number(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.properties
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// `self` with every property of `overlay` written on top.
    pub fn overlaid(&self, overlay: &VisualTarget) -> VisualTarget {
        let mut merged = self.clone();
        for (name, value) in &overlay.properties {
            merged.properties.insert(name.clone(), value.clone());
        }
        merged
    }
}

/// How the renderer should move towards a target. The duration is decided by
/// the binding, not by the profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Motion {
    /// Cubic-bezier tween `[x1, y1, x2, y2]`.
    Tween { ease: [f64; 4] },
    Spring { stiffness: f64, damping: f64 },
}

impl Motion {
    /// Fast-out ease used for attacks.
    pub fn snap() -> Self {
        Self::Tween {
            ease: [0.04, 0.62, 0.23, 0.98],
        }
    }

    /// Bouncy return used for releases.
    pub fn spring_back() -> Self {
        Self::Spring {
            stiffness: 300.0,
            damping: 15.0,
        }
    }
}

/// A target configuration together with the motion used to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationState {
    pub target: VisualTarget,
    pub motion: Motion,
}

impl AnimationState {
    pub fn new(target: VisualTarget, motion: Motion) -> Self {
        Self { target, motion }
    }

    /// An attack towards `target` with the default snap tween.
    pub fn attack(target: VisualTarget) -> Self {
        Self::new(target, Motion::snap())
    }

    /// A release towards `target` with the default spring.
    pub fn release(target: VisualTarget) -> Self {
        Self::new(target, Motion::spring_back())
    }
}

/// Phases a binding reacts to, stored as a 4-bit mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct TriggerSet(u8);

impl TriggerSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn every_phase() -> Self {
        Self((1 << PHASES_PER_CYCLE) - 1)
    }

    /// Phases 1 and 3, the off-beats of the measure.
    pub fn backbeat() -> Self {
        Self(0b1010)
    }

    pub fn only(phase: Phase) -> Self {
        Self(1 << phase.value())
    }

    /// Builds a set from raw phase numbers, rejecting anything outside `0..=3`.
    pub fn from_values(values: &[u8]) -> Result<Self> {
        values.iter().try_fold(Self::empty(), |set, value| {
            Ok(set.with(Phase::new(*value)?))
        })
    }

    pub fn with(self, phase: Phase) -> Self {
        Self(self.0 | 1 << phase.value())
    }

    pub fn contains(self, phase: Phase) -> bool {
        self.0 & (1 << phase.value()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Phase> {
        Phase::all().filter(move |phase| self.contains(*phase))
    }
}

impl FromIterator<Phase> for TriggerSet {
    fn from_iter<I: IntoIterator<Item = Phase>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl TryFrom<Vec<u8>> for TriggerSet {
    type Error = BeatSyncError;

    fn try_from(values: Vec<u8>) -> Result<Self> {
        Self::from_values(&values)
    }
}

impl From<TriggerSet> for Vec<u8> {
    fn from(set: TriggerSet) -> Self {
        set.iter().map(Phase::value).collect()
    }
}

impl fmt::Debug for TriggerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(Phase::value)).finish()
    }
}

/// Where a binding is in its attack/release cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    #[default]
    Idle,
    Attacking,
    Releasing,
}

/// The transition currently handed to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveTransition {
    pub target: VisualTarget,
    pub motion: Motion,
    pub started_at_ms: Millis,
    pub duration_ms: Millis,
}

impl ActiveTransition {
    pub fn ends_at_ms(&self) -> Millis {
        self.started_at_ms + self.duration_ms
    }

    /// Linear progress through the transition in `[0, 1]`.
    pub fn progress(&self, now: Millis) -> f64 {
        if self.duration_ms <= 0.0 {
            return 1.0;
        }
        ((now - self.started_at_ms) / self.duration_ms).clamp(0.0, 1.0)
    }
}

/// Everything a binding needs to know that does not change while it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingPlan {
    pub attack: AnimationState,
    pub release: AnimationState,
    pub triggers: TriggerSet,
    pub tempo: Tempo,
    pub attack_fraction: f64,
    /// Extra attack properties layered on top for specific phases.
    pub phase_attacks: BTreeMap<Phase, VisualTarget>,
}

impl BindingPlan {
    pub fn new(
        attack: AnimationState,
        release: AnimationState,
        triggers: TriggerSet,
        tempo_bpm: f64,
    ) -> Result<Self> {
        Ok(Self {
            attack,
            release,
            triggers,
            tempo: Tempo::from_bpm(tempo_bpm)?,
            attack_fraction: DEFAULT_ATTACK_FRACTION,
            phase_attacks: BTreeMap::new(),
        })
    }

    pub fn set_attack_fraction(&mut self, fraction: f64) -> Result<()> {
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(BeatSyncError::InvalidAttackFraction(fraction));
        }
        self.attack_fraction = fraction;
        Ok(())
    }

    pub fn attack_duration_ms(&self) -> Millis {
        self.tempo.period_ms() * self.attack_fraction
    }

    /// Whatever is left of the tick once the attack is done.
    pub fn release_duration_ms(&self) -> Millis {
        self.tempo.period_ms() - self.attack_duration_ms()
    }

    pub fn attack_target_for(&self, phase: Phase) -> VisualTarget {
        match self.phase_attacks.get(&phase) {
            Some(overlay) => self.attack.target.overlaid(overlay),
            None => self.attack.target.clone(),
        }
    }
}

/// Attack/release state machine of a single binding.
///
/// Pure: it never arms timers itself. Every method that starts a transition
/// returns the delay after which [`on_transition_complete`](Self::on_transition_complete)
/// must be called; the caller keeps at most one such continuation pending.
#[derive(Debug, Clone)]
pub struct BindingMachine {
    plan: Rc<BindingPlan>,
    state: BindingState,
    last_observed: Option<Phase>,
    transition: Option<ActiveTransition>,
    resting: VisualTarget,
    activations: u64,
    restarts: u64,
}

impl BindingMachine {
    pub fn new(plan: Rc<BindingPlan>) -> Self {
        let resting = plan.release.target.clone();
        Self {
            plan,
            state: BindingState::Idle,
            last_observed: None,
            transition: None,
            resting,
            activations: 0,
            restarts: 0,
        }
    }

    /// Handles a phase delivery. Returns the attack duration when an attack
    /// (re)starts.
    pub fn on_phase(&mut self, phase: Phase, now: Millis) -> Option<Millis> {
        if self.last_observed == Some(phase) {
            return None;
        }
        self.last_observed = Some(phase);

        if !self.plan.triggers.contains(phase) {
            return None;
        }

        if self.state != BindingState::Idle {
            self.restarts += 1;
            tracing::trace!(%phase, from = ?self.state, "restarting attack over an unfinished cycle");
        }
        self.activations += 1;

        let duration = self.plan.attack_duration_ms();
        self.state = BindingState::Attacking;
        self.transition = Some(ActiveTransition {
            target: self.plan.attack_target_for(phase),
            motion: self.plan.attack.motion,
            started_at_ms: now,
            duration_ms: duration,
        });
        Some(duration)
    }

    /// Advances after the pending transition finished. Returns the release
    /// duration when the release starts, `None` once the cycle is over.
    pub fn on_transition_complete(&mut self, now: Millis) -> Option<Millis> {
        match self.state {
            BindingState::Attacking => {
                let duration = self.plan.release_duration_ms();
                self.state = BindingState::Releasing;
                self.transition = Some(ActiveTransition {
                    target: self.plan.release.target.clone(),
                    motion: self.plan.release.motion,
                    started_at_ms: now,
                    duration_ms: duration,
                });
                Some(duration)
            }
            BindingState::Releasing => {
                self.state = BindingState::Idle;
                if let Some(done) = self.transition.take() {
                    self.resting = done.target;
                }
                None
            }
            BindingState::Idle => None,
        }
    }

    /// Abandons any running cycle and settles on the release target. The
    /// next phase delivered afterwards counts as a change.
    pub fn halt(&mut self) {
        self.state = BindingState::Idle;
        self.last_observed = None;
        self.transition = None;
        self.resting = self.plan.release.target.clone();
    }

    pub fn state(&self) -> BindingState {
        self.state
    }

    pub fn last_observed_phase(&self) -> Option<Phase> {
        self.last_observed
    }

    pub fn transition(&self) -> Option<&ActiveTransition> {
        self.transition.as_ref()
    }

    /// Target the renderer should currently head towards.
    pub fn current_target(&self) -> &VisualTarget {
        self.transition
            .as_ref()
            .map(|transition| &transition.target)
            .unwrap_or(&self.resting)
    }

    pub fn is_animating(&self) -> bool {
        self.transition.is_some()
    }

    /// Attacks started, restarts included.
    pub fn activations(&self) -> u64 {
        self.activations
    }

    /// Attacks that cut short an unfinished cycle.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn plan(&self) -> &BindingPlan {
        &self.plan
    }
}
