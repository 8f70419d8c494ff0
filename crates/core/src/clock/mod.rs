use std::fmt;

use serde::{Deserialize, Serialize};

use crate::timeline::{Millis, TimerId, TimerQueue};
use crate::{BeatSyncError, Result};

/// Number of phases in one cycle (a 4/4 measure).
pub const PHASES_PER_CYCLE: u8 = 4;

/// Position inside the repeating 4-step cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Phase(u8);

impl Phase {
    pub const ZERO: Phase = Phase(0);

    pub fn new(value: u8) -> Result<Self> {
        if value < PHASES_PER_CYCLE {
            Ok(Self(value))
        } else {
            Err(BeatSyncError::InvalidPhase(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// The phase one tick later.
    pub fn next(self) -> Self {
        Self((self.0 + 1) % PHASES_PER_CYCLE)
    }

    /// Every phase of the cycle in order.
    pub fn all() -> impl Iterator<Item = Phase> {
        (0..PHASES_PER_CYCLE).map(Phase)
    }
}

impl TryFrom<u8> for Phase {
    type Error = BeatSyncError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> Self {
        phase.0
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated tempo in beats per minute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Tempo {
    bpm: f64,
}

impl Tempo {
    /// Rejects non-positive or non-finite tempos, and tempos so small that the
    /// tick period overflows.
    pub fn from_bpm(bpm: f64) -> Result<Self> {
        if !(bpm.is_finite() && bpm > 0.0) || !(60_000.0 / bpm).is_finite() {
            return Err(BeatSyncError::InvalidTempo(bpm));
        }
        Ok(Self { bpm })
    }

    pub fn bpm(self) -> f64 {
        self.bpm
    }

    /// Tick period in milliseconds: `60000 / bpm`.
    pub fn period_ms(self) -> Millis {
        60_000.0 / self.bpm
    }
}

impl TryFrom<f64> for Tempo {
    type Error = BeatSyncError;

    fn try_from(value: f64) -> Result<Self> {
        Self::from_bpm(value)
    }
}

impl From<Tempo> for f64 {
    fn from(tempo: Tempo) -> Self {
        tempo.bpm
    }
}

/// Owner of the phase counter and of the one periodic timer that advances it.
///
/// Stopping the clock drops the timer handle but keeps the phase, so a later
/// restart continues the cycle where it left off.
#[derive(Debug, Default)]
pub struct BeatClock {
    phase: Phase,
    tempo: Option<Tempo>,
    timer: Option<TimerId>,
    starts: u64,
}

impl BeatClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the periodic timer with its first tick one period after `now`.
    ///
    /// The tempo is validated even when the clock is already running; in that
    /// case the call is a no-op and returns `Ok(false)`.
    pub fn start<T: Clone>(
        &mut self,
        tempo_bpm: f64,
        now: Millis,
        timers: &mut TimerQueue<T>,
        tick: T,
    ) -> Result<bool> {
        let tempo = Tempo::from_bpm(tempo_bpm)?;
        if self.is_running() {
            return Ok(false);
        }

        let period = tempo.period_ms();
        self.timer = Some(timers.schedule_repeating(now + period, period, tick));
        self.tempo = Some(tempo);
        self.starts += 1;
        tracing::debug!(bpm = tempo.bpm(), period_ms = period, phase = %self.phase, "beat clock started");
        Ok(true)
    }

    /// Cancels the periodic timer. The phase is left untouched.
    pub fn stop<T: Clone>(&mut self, timers: &mut TimerQueue<T>) -> bool {
        let Some(timer) = self.timer.take() else {
            return false;
        };
        timers.cancel(timer);
        self.tempo = None;
        tracing::debug!(phase = %self.phase, "beat clock stopped");
        true
    }

    /// Moves to the next phase. Called once per timer firing, however late.
    pub fn advance(&mut self) -> Phase {
        self.phase = self.phase.next();
        self.phase
    }

    pub fn current_phase(&self) -> Phase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Tempo of the running clock, `None` while stopped.
    pub fn tempo(&self) -> Option<Tempo> {
        self.tempo
    }

    pub fn timer_handle(&self) -> Option<TimerId> {
        self.timer
    }

    /// How many times a timer has been armed over the clock's lifetime.
    pub fn start_count(&self) -> u64 {
        self.starts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_cycles_through_four_steps() {
        let sequence: Vec<u8> = std::iter::successors(Some(Phase::ZERO), |p| Some(p.next()))
            .take(9)
            .map(Phase::value)
            .collect();
        assert_eq!(sequence, vec![0, 1, 2, 3, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn rejects_out_of_range_phase() {
        assert!(Phase::new(3).is_ok());
        assert!(matches!(Phase::new(4), Err(BeatSyncError::InvalidPhase(4))));
    }

    #[test]
    fn period_follows_tempo() {
        for bpm in [30.0, 60.0, 90.0, 120.0, 174.0, 333.3] {
            let tempo = Tempo::from_bpm(bpm).unwrap();
            assert_eq!(tempo.period_ms(), 60_000.0 / bpm);
        }
        assert_eq!(Tempo::from_bpm(120.0).unwrap().period_ms(), 500.0);
    }

    #[test]
    fn rejects_invalid_tempo() {
        for bpm in [0.0, -120.0, f64::NAN, f64::INFINITY, f64::MIN_POSITIVE / 4.0] {
            assert!(
                matches!(Tempo::from_bpm(bpm), Err(BeatSyncError::InvalidTempo(_))),
                "{bpm} should be rejected"
            );
        }
    }

    #[test]
    fn start_is_idempotent_and_stop_keeps_phase() {
        let mut timers = TimerQueue::new();
        let mut clock = BeatClock::new();

        assert!(clock.start(120.0, 0.0, &mut timers, ()).unwrap());
        let handle = clock.timer_handle().unwrap();
        assert!(!clock.start(120.0, 0.0, &mut timers, ()).unwrap());
        assert_eq!(clock.timer_handle(), Some(handle));
        assert!(timers.contains(handle));
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_due(), Some(500.0));

        clock.advance();
        clock.advance();
        assert!(clock.stop(&mut timers));
        assert!(!clock.stop(&mut timers));
        assert_eq!(clock.timer_handle(), None);
        assert!(!timers.contains(handle));
        assert!(timers.is_empty());
        assert_eq!(clock.current_phase().value(), 2);
        assert_eq!(clock.start_count(), 1);
    }

    #[test]
    fn invalid_tempo_fails_even_when_running() {
        let mut timers = TimerQueue::new();
        let mut clock = BeatClock::new();
        clock.start(120.0, 0.0, &mut timers, ()).unwrap();
        assert!(clock.start(0.0, 0.0, &mut timers, ()).is_err());
        assert_eq!(clock.tempo().map(Tempo::bpm), Some(120.0));
    }

    #[test]
    fn deserialises_validated_values() {
        let phase: Phase = serde_json::from_str("3").unwrap();
        assert_eq!(phase.value(), 3);
        assert!(serde_json::from_str::<Phase>("7").is_err());
        assert!(serde_json::from_str::<Tempo>("-1.0").is_err());
    }
}
