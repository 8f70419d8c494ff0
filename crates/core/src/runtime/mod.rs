use std::time::{Duration, Instant};

use crate::scheduler::BeatScheduler;
use crate::timeline::Millis;
use crate::Result;

/// Drives a [`BeatScheduler`] from the wall clock on the current thread.
///
/// Logical time starts at the scheduler's current time when the driver is
/// created. A driver that wakes up late simply advances further; the clock
/// fires once and moves on rather than replaying missed ticks.
#[derive(Debug)]
pub struct RealtimeDriver {
    scheduler: BeatScheduler,
    origin: Instant,
    origin_ms: Millis,
    frame_interval: Duration,
}

impl RealtimeDriver {
    pub fn new(scheduler: BeatScheduler, frame_interval: Duration) -> Self {
        let origin_ms = scheduler.now_ms();
        Self {
            scheduler,
            origin: Instant::now(),
            origin_ms,
            frame_interval,
        }
    }

    pub fn scheduler(&self) -> &BeatScheduler {
        &self.scheduler
    }

    /// Logical time matching the wall clock right now.
    pub fn wall_ms(&self) -> Millis {
        self.origin_ms + self.origin.elapsed().as_secs_f64() * 1_000.0
    }

    /// Catches the scheduler up with the wall clock.
    pub fn pump(&self) -> Result<u64> {
        self.scheduler.advance_to(self.wall_ms())
    }

    /// Pumps for `duration`, calling `on_frame` after every pump.
    ///
    /// Sleeps until the next scheduler deadline or the frame interval,
    /// whichever comes first.
    pub fn run_for(
        &self,
        duration: Duration,
        mut on_frame: impl FnMut(&BeatScheduler) -> Result<()>,
    ) -> Result<()> {
        let end = Instant::now() + duration;
        loop {
            self.pump()?;
            on_frame(&self.scheduler)?;

            let now = Instant::now();
            if now >= end {
                return Ok(());
            }
            let mut wait = self.frame_interval.min(end - now);
            if let Some(deadline) = self.scheduler.next_deadline() {
                let until = (deadline - self.wall_ms()).max(0.0);
                if let Ok(until) = Duration::try_from_secs_f64(until / 1_000.0) {
                    wait = wait.min(until);
                }
            }
            std::thread::sleep(wait);
        }
    }
}
