//! Logical timer queue driving every deadline in the scheduler.
//!
//! Time is measured in floating point milliseconds on a logical axis that the
//! owner advances explicitly. Nothing here sleeps: a real-time driver maps
//! wall-clock time onto the axis, tests step it by hand.

use std::cmp::Ordering;

/// Milliseconds on the scheduler's logical time axis.
pub type Millis = f64;

/// Opaque handle to an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone)]
struct TimerEntry<T> {
    id: TimerId,
    due: Millis,
    period: Option<Millis>,
    seq: u64,
    payload: T,
}

impl<T> TimerEntry<T> {
    fn order(&self, other: &Self) -> Ordering {
        self.due
            .total_cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// A timer that came due during [`TimerQueue::pop_due`].
#[derive(Debug, Clone, PartialEq)]
pub struct FiredTimer<T> {
    pub id: TimerId,
    pub due: Millis,
    pub payload: T,
    /// Period boundaries of a repeating timer that were dropped instead of
    /// being replayed.
    pub skipped: u64,
}

/// Deadline-ordered set of one-shot and repeating timers.
///
/// Ties on the deadline resolve in arm order, so a continuation armed while
/// handling a tick never overtakes an earlier timer due at the same instant.
#[derive(Debug)]
pub struct TimerQueue<T> {
    entries: Vec<TimerEntry<T>>,
    next_id: u64,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            next_seq: 0,
        }
    }
}

impl<T: Clone> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_once(&mut self, due: Millis, payload: T) -> TimerId {
        self.arm(due, None, payload)
    }

    /// Arms a timer that first fires at `first_due` and then every `period`.
    pub fn schedule_repeating(&mut self, first_due: Millis, period: Millis, payload: T) -> TimerId {
        debug_assert!(period > 0.0, "repeating timers need a positive period");
        self.arm(first_due, Some(period), payload)
    }

    /// Disarms a timer. Returns `false` when it already fired or never existed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn count_where(&self, mut predicate: impl FnMut(&T) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|entry| predicate(&entry.payload))
            .count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest armed deadline, if any.
    pub fn next_due(&self) -> Option<Millis> {
        self.earliest().map(|index| self.entries[index].due)
    }

    /// Removes and returns the earliest timer due at or before `horizon`.
    ///
    /// A repeating timer is re-armed on its own period grid at the first
    /// boundary strictly after `horizon`: boundaries it slept through are
    /// reported in [`FiredTimer::skipped`] and never replayed.
    pub fn pop_due(&mut self, horizon: Millis) -> Option<FiredTimer<T>> {
        let index = self.earliest()?;
        if self.entries[index].due > horizon {
            return None;
        }

        match self.entries[index].period {
            None => {
                let entry = self.entries.swap_remove(index);
                Some(FiredTimer {
                    id: entry.id,
                    due: entry.due,
                    payload: entry.payload,
                    skipped: 0,
                })
            }
            Some(period) => {
                let seq = self.bump_seq();
                let entry = &mut self.entries[index];
                let due = entry.due;
                let (next, skipped) = next_boundary(due, period, horizon);
                entry.due = next;
                entry.seq = seq;
                Some(FiredTimer {
                    id: entry.id,
                    due,
                    payload: entry.payload.clone(),
                    skipped,
                })
            }
        }
    }

    fn arm(&mut self, due: Millis, period: Option<Millis>, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let seq = self.bump_seq();
        self.entries.push(TimerEntry {
            id,
            due,
            period,
            seq,
            payload,
        });
        id
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn earliest(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.order(b))
            .map(|(index, _)| index)
    }
}

/// First `due + k * period` strictly after `horizon` (k >= 1), plus the number
/// of boundaries in between that were slept through.
///
/// `horizon` must be finite. Step counts are kept in `f64` so far horizons
/// cannot overflow; `skipped` saturates.
fn next_boundary(due: Millis, period: Millis, horizon: Millis) -> (Millis, u64) {
    let steps = if horizon > due {
        ((horizon - due) / period).floor() + 1.0
    } else {
        1.0
    };
    let mut next = due + period * steps;
    // Float rounding can land on or before the horizon.
    if next <= horizon {
        next = horizon + period;
    }
    if next <= horizon {
        // `period` is below the precision of `horizon`.
        next = horizon + horizon.abs() * f64::EPSILON;
    }
    (next, (steps - 1.0) as u64)
}
