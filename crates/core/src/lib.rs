//! Core library for the beatsync scheduler.
//!
//! One [`BeatScheduler`] per application owns a 4-phase [`BeatClock`] and the
//! [`SubscriptionRegistry`] of everything listening to it. Consumers either
//! observe the phase directly ([`BeatObserver`]) or attach an
//! [`AnimationBinding`] built by an [`AnimationBindingFactory`], which plays
//! an attack then a release in lockstep with the clock. Time is logical and
//! advanced explicitly; [`RealtimeDriver`] ties it to the wall clock.

pub mod animation;
pub mod binding;
pub mod clock;
pub mod config;
pub mod error;
pub mod registry;
pub mod render;
pub mod runtime;
pub mod scheduler;
pub mod timeline;

pub use animation::{
    ActiveTransition, AnimationState, BindingMachine, BindingPlan, BindingState, Motion,
    PropertyValue, TriggerSet, VisualTarget,
};
pub use binding::{presets, AnimationBinding, AnimationBindingFactory, BindingSnapshot};
pub use clock::{BeatClock, Phase, Tempo};
pub use config::{AppConfig, BindingConfig, BindingSource, SchedulerConfig};
pub use error::{BeatSyncError, Result};
pub use registry::{ObserverContext, ObserverId, PhaseObserver, SharedObserver, SubscriptionRegistry};
pub use render::{LayerFrame, RenderFrame, RenderGraph};
pub use runtime::RealtimeDriver;
pub use scheduler::{BeatObserver, BeatScheduler, Subscription};
pub use timeline::{Millis, TimerId, TimerQueue};
