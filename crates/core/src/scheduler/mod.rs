//! The application-wide beat scheduler.
//!
//! # Lifecycle
//!
//! [`BeatScheduler::init`] builds one scheduler per application instance; the
//! cheap-to-clone handle is then passed to everything that wants
//! beat-synchronised behaviour. [`BeatScheduler::shutdown`] stops the clock,
//! drops every observer and rejects further subscriptions.
//!
//! # Invariants
//!
//! 1. At most one clock timer is armed, whatever the subscriber count.
//! 2. The first subscriber starts the clock, the last one stops it; the phase
//!    survives the stop.
//! 3. Every observer registered when a tick fires sees that tick's phase, and
//!    all of them see it before anyone sees the next one.
//! 4. A removed observer never receives another phase or timer callback.
//!
//! The scheduler is `Rc`-based and therefore `!Send`: all mutation happens on
//! the thread that drives [`BeatScheduler::advance_to`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::clock::{BeatClock, Phase, Tempo};
use crate::config::SchedulerConfig;
use crate::registry::{
    ObserverContext, ObserverId, PhaseObserver, SharedObserver, SubscriptionRegistry, TimerRequest,
};
use crate::timeline::{Millis, TimerId, TimerQueue};
use crate::{BeatSyncError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerEvent {
    ClockTick,
    Continuation(ObserverId),
}

#[derive(Debug)]
struct SchedulerState {
    clock: BeatClock,
    registry: SubscriptionRegistry,
    timers: TimerQueue<TimerEvent>,
    default_tempo: Tempo,
    now: Millis,
    ticks: u64,
    dispatching: bool,
    shut_down: bool,
}

impl SchedulerState {
    fn ensure_live(&self) -> Result<()> {
        if self.shut_down {
            Err(BeatSyncError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn remove(&mut self, id: ObserverId) -> Option<SharedObserver> {
        let (observer, pending) = self.registry.remove(id)?;
        if let Some(timer) = pending {
            self.timers.cancel(timer);
        }
        if self.registry.is_empty() {
            self.clock.stop(&mut self.timers);
        }
        tracing::debug!(observer = %id, remaining = self.registry.len(), "observer unsubscribed");
        Some(observer)
    }

    fn apply(&mut self, id: ObserverId, request: Option<TimerRequest>) {
        let Some(request) = request else {
            return;
        };
        if !self.registry.contains(id) {
            return;
        }
        let timer = match request {
            TimerRequest::Arm(delay) => Some(
                self.timers
                    .schedule_once(self.now + delay, TimerEvent::Continuation(id)),
            ),
            TimerRequest::Disarm => None,
        };
        if let Some(previous) = self.registry.replace_pending(id, timer) {
            self.timers.cancel(previous);
        }
    }
}

/// Handle to the shared clock, registry and timer queue.
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct BeatScheduler {
    state: Rc<RefCell<SchedulerState>>,
}

impl BeatScheduler {
    /// Creates the scheduler. The clock stays stopped until the first
    /// subscription arrives.
    pub fn init(config: &SchedulerConfig) -> Result<Self> {
        Self::new(config.tempo_bpm)
    }

    /// Creates a scheduler whose subscriptions default to `tempo_bpm`.
    pub fn new(tempo_bpm: f64) -> Result<Self> {
        let default_tempo = Tempo::from_bpm(tempo_bpm)?;
        Ok(Self {
            state: Rc::new(RefCell::new(SchedulerState {
                clock: BeatClock::new(),
                registry: SubscriptionRegistry::new(),
                timers: TimerQueue::new(),
                default_tempo,
                now: 0.0,
                ticks: 0,
                dispatching: false,
                shut_down: false,
            })),
        })
    }

    /// Stops the clock, cancels every timer and drops all observers.
    /// Outstanding [`Subscription`]s become inert.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.state.borrow_mut();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            let SchedulerState { clock, timers, .. } = &mut *state;
            clock.stop(timers);
            timers.clear();
            let drained = state.registry.drain();
            drained
        };
        tracing::debug!(observers = drained.len(), "beat scheduler shut down");
        drop(drained);
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.borrow().shut_down
    }

    /// Subscribes at the scheduler's default tempo.
    pub fn subscribe(&self, observer: SharedObserver) -> Result<Subscription> {
        let tempo = self.state.borrow().default_tempo;
        self.subscribe_at(observer, tempo.bpm())
    }

    /// Subscribes and, if this is the first observer, starts the clock at
    /// `tempo_bpm`.
    ///
    /// A running clock keeps its tempo: a late subscriber asking for a
    /// different one is logged and otherwise ignored until the clock has been
    /// fully stopped and restarted.
    pub fn subscribe_at(&self, observer: SharedObserver, tempo_bpm: f64) -> Result<Subscription> {
        let tempo = Tempo::from_bpm(tempo_bpm)?;
        let mut state = self.state.borrow_mut();
        state.ensure_live()?;

        let id = state
            .registry
            .insert(observer)
            .map_err(|existing| BeatSyncError::AlreadySubscribed(existing.raw()))?;

        let now = state.now;
        let SchedulerState { clock, timers, .. } = &mut *state;
        let started = clock.start(tempo.bpm(), now, timers, TimerEvent::ClockTick)?;
        if !started {
            if let Some(running) = clock.tempo().filter(|running| *running != tempo) {
                tracing::warn!(
                    requested_bpm = tempo.bpm(),
                    running_bpm = running.bpm(),
                    "clock already running at another tempo; keeping the running tempo"
                );
            }
        }
        tracing::debug!(observer = %id, total = state.registry.len(), "observer subscribed");

        Ok(Subscription {
            id,
            scheduler: Rc::downgrade(&self.state),
        })
    }

    /// Subscribes a closure that is called with every new phase.
    pub fn subscribe_fn(&self, callback: impl FnMut(Phase) + 'static) -> Result<Subscription> {
        self.subscribe(Rc::new(RefCell::new(CallbackObserver(callback))))
    }

    /// Subscribes a handle that tracks the latest phase.
    pub fn observe(&self) -> Result<BeatObserver> {
        let cell = Rc::new(PhaseCell {
            phase: Cell::new(self.current_phase()),
            changes: Cell::new(0),
        });
        let subscription = self.subscribe(Rc::new(RefCell::new(PhaseCellObserver(cell.clone()))))?;
        Ok(BeatObserver { cell, subscription })
    }

    /// Removes an observer. Unknown or already removed ids are a no-op.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        unsubscribe(&self.state, id)
    }

    pub fn is_subscribed(&self, id: ObserverId) -> bool {
        self.state.borrow().registry.contains(id)
    }

    /// Delivers `phase` to every currently registered observer.
    ///
    /// Iterates over a snapshot: observers removed during the pass are
    /// skipped, observers added during the pass first hear the next phase.
    fn notify(&self, phase: Phase) {
        let (snapshot, now) = {
            let state = self.state.borrow();
            (state.registry.snapshot(), state.now)
        };
        tracing::trace!(%phase, observers = snapshot.len(), "delivering tick");

        for (id, observer) in snapshot {
            if !self.is_subscribed(id) {
                continue;
            }
            let mut cx = ObserverContext::new(id, now);
            observer.borrow_mut().on_phase(phase, &mut cx);
            self.state.borrow_mut().apply(id, cx.into_request());
        }
    }

    fn fire_continuation(&self, id: ObserverId, timer: TimerId) {
        let (observer, now) = {
            let mut state = self.state.borrow_mut();
            if state.registry.pending(id) != Some(timer) {
                return;
            }
            state.registry.replace_pending(id, None);
            match state.registry.get(id) {
                Some(observer) => (observer, state.now),
                None => return,
            }
        };
        let mut cx = ObserverContext::new(id, now);
        observer.borrow_mut().on_timer(&mut cx);
        self.state.borrow_mut().apply(id, cx.into_request());
    }

    /// Runs every timer due up to `target_ms` in deadline order and moves the
    /// logical clock to `target_ms`. Returns the number of clock ticks fired.
    ///
    /// A clock timer that slept through several periods fires once; the
    /// skipped periods are not replayed.
    pub fn advance_to(&self, target_ms: Millis) -> Result<u64> {
        if !target_ms.is_finite() {
            return Err(BeatSyncError::InvalidTime(target_ms));
        }
        {
            let mut state = self.state.borrow_mut();
            state.ensure_live()?;
            if state.dispatching {
                return Err(BeatSyncError::ReentrantAdvance);
            }
            state.dispatching = true;
        }
        let _guard = DispatchGuard(&self.state);

        let mut ticks = 0;
        loop {
            let fired = {
                let mut state = self.state.borrow_mut();
                let fired = state.timers.pop_due(target_ms);
                if let Some(fired) = &fired {
                    state.now = state.now.max(fired.due);
                }
                fired
            };
            let Some(fired) = fired else {
                break;
            };

            match fired.payload {
                TimerEvent::ClockTick => {
                    let phase = {
                        let mut state = self.state.borrow_mut();
                        state.ticks += 1;
                        state.clock.advance()
                    };
                    if fired.skipped > 0 {
                        tracing::warn!(skipped = fired.skipped, "beat clock fell behind; skipped ticks are not replayed");
                    }
                    ticks += 1;
                    self.notify(phase);
                }
                TimerEvent::Continuation(id) => self.fire_continuation(id, fired.id),
            }
        }

        let mut state = self.state.borrow_mut();
        state.now = state.now.max(target_ms);
        Ok(ticks)
    }

    /// Advances the logical clock by `delta_ms`.
    pub fn advance_by(&self, delta_ms: Millis) -> Result<u64> {
        let target = self.now_ms() + delta_ms.max(0.0);
        self.advance_to(target)
    }

    pub fn now_ms(&self) -> Millis {
        self.state.borrow().now
    }

    /// Next armed deadline of any kind.
    pub fn next_deadline(&self) -> Option<Millis> {
        self.state.borrow().timers.next_due()
    }

    pub fn current_phase(&self) -> Phase {
        self.state.borrow().clock.current_phase()
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().clock.is_running()
    }

    /// Tempo of the running clock, `None` while it is stopped.
    pub fn running_tempo(&self) -> Option<Tempo> {
        self.state.borrow().clock.tempo()
    }

    pub fn default_tempo(&self) -> Tempo {
        self.state.borrow().default_tempo
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.borrow().registry.len()
    }

    /// Number of armed clock timers. Never more than one.
    pub fn clock_timer_count(&self) -> usize {
        self.state
            .borrow()
            .timers
            .count_where(|event| *event == TimerEvent::ClockTick)
    }

    /// Number of armed observer continuations.
    pub fn pending_continuations(&self) -> usize {
        self.state
            .borrow()
            .timers
            .count_where(|event| matches!(event, TimerEvent::Continuation(_)))
    }

    /// How many times the clock timer has been armed.
    pub fn clock_starts(&self) -> u64 {
        self.state.borrow().clock.start_count()
    }

    /// Ticks fired over the scheduler's lifetime.
    pub fn tick_count(&self) -> u64 {
        self.state.borrow().ticks
    }
}

impl fmt::Debug for BeatScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_borrow() {
            Ok(state) => f
                .debug_struct("BeatScheduler")
                .field("now", &state.now)
                .field("phase", &state.clock.current_phase())
                .field("running", &state.clock.is_running())
                .field("subscribers", &state.registry.len())
                .finish(),
            Err(_) => f.debug_struct("BeatScheduler").finish_non_exhaustive(),
        }
    }
}

fn unsubscribe(state: &Rc<RefCell<SchedulerState>>, id: ObserverId) -> bool {
    let removed = state.borrow_mut().remove(id);
    // Dropped here, outside the borrow.
    removed.is_some()
}

struct DispatchGuard<'a>(&'a Rc<RefCell<SchedulerState>>);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.try_borrow_mut() {
            state.dispatching = false;
        }
    }
}

/// RAII registration. Dropping it unsubscribes the observer.
pub struct Subscription {
    id: ObserverId,
    scheduler: Weak<RefCell<SchedulerState>>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Whether the observer is still registered.
    pub fn is_active(&self) -> bool {
        self.scheduler.upgrade().is_some_and(|state| {
            let state = state.borrow();
            state.registry.contains(self.id)
        })
    }

    /// Unsubscribes now instead of at drop.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.scheduler.upgrade() {
            unsubscribe(&state, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

struct CallbackObserver<F>(F);

impl<F: FnMut(Phase)> PhaseObserver for CallbackObserver<F> {
    fn on_phase(&mut self, phase: Phase, _cx: &mut ObserverContext) {
        (self.0)(phase);
    }
}

#[derive(Debug)]
struct PhaseCell {
    phase: Cell<Phase>,
    changes: Cell<u64>,
}

struct PhaseCellObserver(Rc<PhaseCell>);

impl PhaseObserver for PhaseCellObserver {
    fn on_phase(&mut self, phase: Phase, _cx: &mut ObserverContext) {
        if self.0.phase.get() != phase {
            self.0.phase.set(phase);
            self.0.changes.set(self.0.changes.get() + 1);
        }
    }
}

/// Consumer-scoped view of the current phase. Unsubscribes on drop.
#[derive(Debug)]
pub struct BeatObserver {
    cell: Rc<PhaseCell>,
    subscription: Subscription,
}

impl BeatObserver {
    pub fn phase(&self) -> Phase {
        self.cell.phase.get()
    }

    /// Number of phase changes seen since subscribing.
    pub fn changes(&self) -> u64 {
        self.cell.changes.get()
    }

    pub fn id(&self) -> ObserverId {
        self.subscription.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> BeatScheduler {
        BeatScheduler::new(120.0).unwrap()
    }

    fn recording(scheduler: &BeatScheduler) -> (Rc<RefCell<Vec<u8>>>, Subscription) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let subscription = scheduler
            .subscribe_fn(move |phase| sink.borrow_mut().push(phase.value()))
            .unwrap();
        (log, subscription)
    }

    #[test]
    fn ticks_once_per_period() {
        for bpm in [60.0, 120.0, 140.0] {
            let scheduler = BeatScheduler::new(bpm).unwrap();
            let (log, _sub) = recording(&scheduler);
            let period = 60_000.0 / bpm;

            scheduler.advance_to(period - 0.001).unwrap();
            assert!(log.borrow().is_empty());
            assert_eq!(scheduler.advance_to(period).unwrap(), 1);
            assert_eq!(scheduler.next_deadline(), Some(period * 2.0));
        }
    }

    #[test]
    fn phases_cycle_in_order() {
        let scheduler = scheduler();
        let (log, _sub) = recording(&scheduler);

        for step in 1..=9 {
            scheduler.advance_to(step as f64 * 500.0).unwrap();
        }
        assert_eq!(*log.borrow(), vec![1, 2, 3, 0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn every_subscriber_sees_the_same_phase() {
        let scheduler = scheduler();
        let subs: Vec<_> = (0..5).map(|_| recording(&scheduler)).collect();

        scheduler.advance_to(2_000.0).unwrap();
        for (log, _) in &subs {
            assert_eq!(*log.borrow(), vec![1, 2, 3, 0]);
        }
    }

    #[test]
    fn only_the_first_subscriber_starts_a_timer() {
        let scheduler = scheduler();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.clock_timer_count(), 0);

        let _a = recording(&scheduler);
        assert_eq!(scheduler.clock_timer_count(), 1);
        let _b = recording(&scheduler);
        let _c = recording(&scheduler);
        assert_eq!(scheduler.clock_timer_count(), 1);
        assert_eq!(scheduler.clock_starts(), 1);
    }

    #[test]
    fn last_unsubscribe_stops_and_keeps_phase() {
        let scheduler = scheduler();
        let (_, sub) = recording(&scheduler);
        scheduler.advance_to(1_000.0).unwrap();
        assert_eq!(scheduler.current_phase().value(), 2);

        drop(sub);
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.clock_timer_count(), 0);
        scheduler.advance_to(5_000.0).unwrap();
        assert_eq!(scheduler.current_phase().value(), 2);

        let observer = scheduler.observe().unwrap();
        assert_eq!(observer.phase().value(), 2);
        assert_eq!(scheduler.clock_starts(), 2);

        // No synthetic tick on restart: the next phase lands a full period later.
        scheduler.advance_to(5_499.0).unwrap();
        assert_eq!(observer.changes(), 0);
        scheduler.advance_to(5_500.0).unwrap();
        assert_eq!(observer.phase().value(), 3);
        assert_eq!(observer.changes(), 1);
    }

    #[test]
    fn unsubscribing_unknown_observer_is_a_noop() {
        let scheduler = scheduler();
        let (_, sub) = recording(&scheduler);
        let id = sub.id();
        assert!(scheduler.unsubscribe(id));
        assert!(!scheduler.unsubscribe(id));
        assert!(!sub.is_active());
        drop(sub);
        assert_eq!(scheduler.subscriber_count(), 0);
    }

    #[test]
    fn rejects_duplicate_subscription() {
        let scheduler = scheduler();
        let observer: SharedObserver =
            Rc::new(RefCell::new(CallbackObserver(|_phase: Phase| {})));
        let sub = scheduler.subscribe(observer.clone()).unwrap();

        let err = scheduler.subscribe(observer).unwrap_err();
        assert!(matches!(err, BeatSyncError::AlreadySubscribed(id) if id == sub.id().raw()));
        assert_eq!(scheduler.subscriber_count(), 1);
    }

    #[test]
    fn invalid_tempo_fails_fast() {
        assert!(matches!(
            BeatScheduler::new(0.0),
            Err(BeatSyncError::InvalidTempo(_))
        ));
        let scheduler = scheduler();
        let observer: SharedObserver =
            Rc::new(RefCell::new(CallbackObserver(|_phase: Phase| {})));
        assert!(scheduler.subscribe_at(observer, -10.0).is_err());
        assert_eq!(scheduler.subscriber_count(), 0);
        assert!(!scheduler.is_running());
    }

    #[test]
    fn late_subscriber_cannot_retime_running_clock() {
        let scheduler = scheduler();
        let _first = recording(&scheduler);
        let observer: SharedObserver =
            Rc::new(RefCell::new(CallbackObserver(|_phase: Phase| {})));
        let _second = scheduler.subscribe_at(observer, 60.0).unwrap();

        assert_eq!(scheduler.running_tempo().map(Tempo::bpm), Some(120.0));
        assert_eq!(scheduler.advance_to(1_000.0).unwrap(), 2);
    }

    #[test]
    fn observers_may_unsubscribe_each_other_mid_tick() {
        let scheduler = scheduler();
        let victim_log = Rc::new(RefCell::new(Vec::new()));
        let victim_id = Rc::new(Cell::new(None));

        let handle = scheduler.clone();
        let target = victim_id.clone();
        let killer = scheduler
            .subscribe_fn(move |_phase| {
                if let Some(id) = target.get() {
                    handle.unsubscribe(id);
                }
            })
            .unwrap();

        let sink = victim_log.clone();
        let victim = scheduler
            .subscribe_fn(move |phase| sink.borrow_mut().push(phase))
            .unwrap();
        victim_id.set(Some(victim.id()));

        scheduler.advance_to(2_000.0).unwrap();
        assert!(victim_log.borrow().is_empty());
        assert!(!victim.is_active());
        assert!(killer.is_active());

        // The killer closure holds a scheduler handle; break the cycle.
        scheduler.shutdown();
    }

    #[test]
    fn observers_added_mid_tick_wait_for_the_next_phase() {
        let scheduler = scheduler();
        let late_log = Rc::new(RefCell::new(Vec::new()));
        let late_sub = Rc::new(RefCell::new(None));

        let handle = scheduler.clone();
        let sink = late_log.clone();
        let slot = late_sub.clone();
        let _spawner = scheduler
            .subscribe_fn(move |_phase| {
                if slot.borrow().is_none() {
                    let sink = sink.clone();
                    let sub = handle
                        .subscribe_fn(move |phase| sink.borrow_mut().push(phase.value()))
                        .unwrap();
                    *slot.borrow_mut() = Some(sub);
                }
            })
            .unwrap();

        scheduler.advance_to(500.0).unwrap();
        assert!(late_log.borrow().is_empty());
        scheduler.advance_to(1_000.0).unwrap();
        assert_eq!(*late_log.borrow(), vec![2]);

        scheduler.shutdown();
    }

    #[test]
    fn advancing_from_a_callback_is_rejected() {
        let scheduler = scheduler();
        let outcome = Rc::new(RefCell::new(None));
        let handle = scheduler.clone();
        let slot = outcome.clone();
        let _sub = scheduler
            .subscribe_fn(move |_phase| {
                *slot.borrow_mut() = Some(handle.advance_by(500.0).is_err());
            })
            .unwrap();

        scheduler.advance_to(500.0).unwrap();
        assert_eq!(*outcome.borrow(), Some(true));
        assert_eq!(scheduler.current_phase().value(), 1);

        scheduler.shutdown();
    }

    #[test]
    fn slow_driver_does_not_replay_missed_ticks() {
        let scheduler = scheduler();
        let (log, _sub) = recording(&scheduler);

        assert_eq!(scheduler.advance_to(2_200.0).unwrap(), 1);
        assert_eq!(*log.borrow(), vec![1]);
        assert_eq!(scheduler.next_deadline(), Some(2_500.0));
        scheduler.advance_to(2_500.0).unwrap();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn non_finite_targets_are_rejected() {
        let scheduler = scheduler();
        let observer = scheduler.observe().unwrap();

        for target in [f64::INFINITY, f64::NAN, f64::NEG_INFINITY] {
            assert!(matches!(
                scheduler.advance_to(target),
                Err(BeatSyncError::InvalidTime(_))
            ));
        }
        assert!(scheduler.advance_by(f64::INFINITY).is_err());
        assert_eq!(scheduler.now_ms(), 0.0);
        assert_eq!(observer.changes(), 0);

        // The scheduler is still usable afterwards.
        assert_eq!(scheduler.advance_to(500.0).unwrap(), 1);
    }

    #[test]
    fn far_target_fires_one_tick() {
        let scheduler = scheduler();
        let (log, _sub) = recording(&scheduler);

        assert_eq!(scheduler.advance_to(1e300).unwrap(), 1);
        assert_eq!(*log.borrow(), vec![1]);
        assert_eq!(scheduler.now_ms(), 1e300);
        assert!(scheduler.next_deadline().unwrap() > 1e300);
    }

    #[test]
    fn shutdown_clears_everything() {
        let scheduler = scheduler();
        let (_, sub) = recording(&scheduler);
        scheduler.shutdown();

        assert!(scheduler.is_shut_down());
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.subscriber_count(), 0);
        assert!(!sub.is_active());
        assert!(matches!(
            scheduler.subscribe_fn(|_| {}),
            Err(BeatSyncError::ShutDown)
        ));
        assert!(matches!(
            scheduler.advance_to(1_000.0),
            Err(BeatSyncError::ShutDown)
        ));
    }
}
