use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::animation::{
    ActiveTransition, AnimationState, BindingMachine, BindingPlan, BindingState, TriggerSet,
    VisualTarget,
};
use crate::clock::{Phase, Tempo};
use crate::registry::{ObserverContext, PhaseObserver, SharedObserver};
use crate::scheduler::{BeatScheduler, Subscription};
use crate::timeline::Millis;
use crate::Result;

pub mod presets;

/// Renderable view of a binding at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingSnapshot {
    pub state: BindingState,
    pub target: VisualTarget,
    pub transition: Option<ActiveTransition>,
    pub in_flight: bool,
    pub last_observed_phase: Option<Phase>,
    pub activations: u64,
}

struct BindingObserver {
    machine: BindingMachine,
}

impl PhaseObserver for BindingObserver {
    fn on_phase(&mut self, phase: Phase, cx: &mut ObserverContext) {
        if let Some(attack) = self.machine.on_phase(phase, cx.now_ms()) {
            tracing::trace!(observer = %cx.observer_id(), %phase, attack_ms = attack, "binding attacking");
            cx.arm(attack);
        }
    }

    fn on_timer(&mut self, cx: &mut ObserverContext) {
        match self.machine.on_transition_complete(cx.now_ms()) {
            Some(release) => cx.arm(release),
            None => cx.disarm(),
        }
    }
}

/// A consumer's animation: one state machine plus its registration.
///
/// Detached bindings are inert. Dropping an attached binding unsubscribes it
/// and cancels its pending transition.
pub struct AnimationBinding {
    core: Rc<RefCell<BindingObserver>>,
    subscription: Option<Subscription>,
}

impl AnimationBinding {
    fn new(plan: Rc<BindingPlan>) -> Self {
        Self {
            core: Rc::new(RefCell::new(BindingObserver {
                machine: BindingMachine::new(plan),
            })),
            subscription: None,
        }
    }

    /// Starts feeding phases from `scheduler` into the binding. The binding's
    /// tempo is offered to the clock; a running clock keeps its own.
    pub fn attach(&mut self, scheduler: &BeatScheduler) -> Result<()> {
        if self.is_attached() {
            return Ok(());
        }
        let tempo = self.core.borrow().machine.plan().tempo;
        let observer: SharedObserver = self.core.clone();
        self.subscription = Some(scheduler.subscribe_at(observer, tempo.bpm())?);
        Ok(())
    }

    /// Unsubscribes and settles on the release target. Returns whether the
    /// binding was attached.
    pub fn detach(&mut self) -> bool {
        let Some(subscription) = self.subscription.take() else {
            return false;
        };
        drop(subscription);
        self.core.borrow_mut().machine.halt();
        true
    }

    pub fn is_attached(&self) -> bool {
        self.subscription
            .as_ref()
            .map(Subscription::is_active)
            .unwrap_or(false)
    }

    pub fn state(&self) -> BindingState {
        self.core.borrow().machine.state()
    }

    pub fn current_target(&self) -> VisualTarget {
        self.core.borrow().machine.current_target().clone()
    }

    pub fn is_animating(&self) -> bool {
        self.core.borrow().machine.is_animating()
    }

    pub fn tempo(&self) -> Tempo {
        self.core.borrow().machine.plan().tempo
    }

    pub fn snapshot(&self) -> BindingSnapshot {
        let core = self.core.borrow();
        let machine = &core.machine;
        BindingSnapshot {
            state: machine.state(),
            target: machine.current_target().clone(),
            transition: machine.transition().cloned(),
            in_flight: machine.is_animating(),
            last_observed_phase: machine.last_observed_phase(),
            activations: machine.activations(),
        }
    }

    /// Progress of the running transition at `now`, if any.
    pub fn progress(&self, now: Millis) -> Option<f64> {
        self.core
            .borrow()
            .machine
            .transition()
            .map(|transition| transition.progress(now))
    }
}

impl fmt::Debug for AnimationBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnimationBinding")
            .field("state", &self.state())
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Reusable recipe for bindings that share descriptors, triggers and tempo.
///
/// Construction is pure. Each [`create`](Self::create) call yields an
/// independent state machine.
#[derive(Debug, Clone)]
pub struct AnimationBindingFactory {
    plan: Rc<BindingPlan>,
}

impl AnimationBindingFactory {
    pub fn new(
        attack: AnimationState,
        release: AnimationState,
        triggers: TriggerSet,
        tempo_bpm: f64,
    ) -> Result<Self> {
        Ok(Self {
            plan: Rc::new(BindingPlan::new(attack, release, triggers, tempo_bpm)?),
        })
    }

    /// Share of the tick spent attacking, strictly between 0 and 1.
    pub fn with_attack_fraction(mut self, fraction: f64) -> Result<Self> {
        Rc::make_mut(&mut self.plan).set_attack_fraction(fraction)?;
        Ok(self)
    }

    /// Layers `overlay` onto the attack target when triggered by `phase`.
    pub fn with_phase_attack(mut self, phase: Phase, overlay: VisualTarget) -> Self {
        Rc::make_mut(&mut self.plan)
            .phase_attacks
            .insert(phase, overlay);
        self
    }

    pub fn create(&self) -> AnimationBinding {
        AnimationBinding::new(self.plan.clone())
    }

    pub fn plan(&self) -> &BindingPlan {
        &self.plan
    }
}

/// One-shot form of [`AnimationBindingFactory::create`].
pub fn create(
    attack: AnimationState,
    release: AnimationState,
    triggers: TriggerSet,
    tempo_bpm: f64,
) -> Result<AnimationBinding> {
    Ok(AnimationBindingFactory::new(attack, release, triggers, tempo_bpm)?.create())
}
