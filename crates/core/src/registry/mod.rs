//! Observer bookkeeping for the beat scheduler.
//!
//! The registry only stores observers and their pending continuation timer.
//! Starting and stopping the clock around the first and last subscriber is
//! coordinated by [`BeatScheduler`](crate::BeatScheduler), which owns both.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::clock::Phase;
use crate::timeline::{Millis, TimerId};

/// Identity of a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something that wants to hear about phase changes.
///
/// Callbacks run with no scheduler borrow held, so they may subscribe or
/// unsubscribe through a [`BeatScheduler`](crate::BeatScheduler) handle. They
/// must not read their own observer cell through another handle while running.
pub trait PhaseObserver {
    fn on_phase(&mut self, phase: Phase, cx: &mut ObserverContext);

    /// Called when the continuation armed through [`ObserverContext::arm`]
    /// comes due.
    fn on_timer(&mut self, _cx: &mut ObserverContext) {}
}

/// Shared handle to a registered observer.
pub type SharedObserver = Rc<RefCell<dyn PhaseObserver>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TimerRequest {
    Arm(Millis),
    Disarm,
}

/// Per-callback view handed to an observer.
///
/// Each subscription owns at most one pending continuation timer; arming a new
/// one replaces whatever was pending.
#[derive(Debug)]
pub struct ObserverContext {
    id: ObserverId,
    now: Millis,
    request: Option<TimerRequest>,
}

impl ObserverContext {
    pub(crate) fn new(id: ObserverId, now: Millis) -> Self {
        Self {
            id,
            now,
            request: None,
        }
    }

    pub fn observer_id(&self) -> ObserverId {
        self.id
    }

    /// Logical time of the event being delivered.
    pub fn now_ms(&self) -> Millis {
        self.now
    }

    /// Schedules this observer's continuation `delay_ms` from now.
    pub fn arm(&mut self, delay_ms: Millis) {
        self.request = Some(TimerRequest::Arm(delay_ms.max(0.0)));
    }

    /// Drops any pending continuation.
    pub fn disarm(&mut self) {
        self.request = Some(TimerRequest::Disarm);
    }

    pub(crate) fn into_request(self) -> Option<TimerRequest> {
        self.request
    }
}

struct ObserverEntry {
    observer: SharedObserver,
    pending: Option<TimerId>,
}

/// Set of active observers, unique by identity.
#[derive(Default)]
pub struct SubscriptionRegistry {
    observers: BTreeMap<ObserverId, ObserverEntry>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer`, or reports the id it is already registered under.
    pub fn insert(&mut self, observer: SharedObserver) -> Result<ObserverId, ObserverId> {
        if let Some(existing) = self.find(&observer) {
            return Err(existing);
        }
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.insert(
            id,
            ObserverEntry {
                observer,
                pending: None,
            },
        );
        Ok(id)
    }

    /// Removes an observer, handing back its shared handle and pending timer.
    ///
    /// The caller must drop the returned handle outside of any scheduler
    /// borrow since it may own arbitrary consumer state.
    pub fn remove(&mut self, id: ObserverId) -> Option<(SharedObserver, Option<TimerId>)> {
        self.observers
            .remove(&id)
            .map(|entry| (entry.observer, entry.pending))
    }

    /// Removes every observer at once.
    pub fn drain(&mut self) -> Vec<(SharedObserver, Option<TimerId>)> {
        std::mem::take(&mut self.observers)
            .into_values()
            .map(|entry| (entry.observer, entry.pending))
            .collect()
    }

    pub fn contains(&self, id: ObserverId) -> bool {
        self.observers.contains_key(&id)
    }

    pub fn get(&self, id: ObserverId) -> Option<SharedObserver> {
        self.observers.get(&id).map(|entry| entry.observer.clone())
    }

    /// Copy of the current observer set for a fan-out pass.
    pub fn snapshot(&self) -> Vec<(ObserverId, SharedObserver)> {
        self.observers
            .iter()
            .map(|(id, entry)| (*id, entry.observer.clone()))
            .collect()
    }

    pub fn pending(&self, id: ObserverId) -> Option<TimerId> {
        self.observers.get(&id).and_then(|entry| entry.pending)
    }

    /// Replaces the pending timer of `id`, returning the previous one.
    pub fn replace_pending(&mut self, id: ObserverId, timer: Option<TimerId>) -> Option<TimerId> {
        self.observers
            .get_mut(&id)
            .and_then(|entry| std::mem::replace(&mut entry.pending, timer))
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    fn find(&self, observer: &SharedObserver) -> Option<ObserverId> {
        let needle = Rc::as_ptr(observer) as *const ();
        self.observers
            .iter()
            .find(|(_, entry)| Rc::as_ptr(&entry.observer) as *const () == needle)
            .map(|(id, _)| *id)
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("observers", &self.observers.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Vec<Phase>);

    impl PhaseObserver for Recorder {
        fn on_phase(&mut self, phase: Phase, _cx: &mut ObserverContext) {
            self.0.push(phase);
        }
    }

    fn recorder() -> SharedObserver {
        Rc::new(RefCell::new(Recorder(Vec::new())))
    }

    #[test]
    fn identity_is_unique() {
        let mut registry = SubscriptionRegistry::new();
        let observer = recorder();
        let id = registry.insert(observer.clone()).unwrap();

        assert_eq!(registry.insert(observer), Err(id));
        assert!(registry.insert(recorder()).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn removing_unknown_ids_is_harmless() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry.insert(recorder()).unwrap();
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_survives_mutation() {
        let mut registry = SubscriptionRegistry::new();
        let first = registry.insert(recorder()).unwrap();
        registry.insert(recorder()).unwrap();

        let snapshot = registry.snapshot();
        registry.remove(first);
        registry.insert(recorder()).unwrap();

        assert_eq!(snapshot.len(), 2);
        assert!(!registry.contains(first));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn context_keeps_the_latest_request() {
        let mut cx = ObserverContext::new(ObserverId(7), 100.0);
        cx.arm(50.0);
        cx.arm(-3.0);
        assert_eq!(cx.observer_id().raw(), 7);
        assert_eq!(cx.into_request(), Some(TimerRequest::Arm(0.0)));
    }
}
