// Fixed-period loop timing

use std::thread;
use std::time::{Duration, Instant};

/// Absolute-deadline timer for the application loop.
///
/// Deadlines advance by exactly one period per call. A cycle that overruns its
/// deadline returns immediately and the following cycles catch up, so the
/// long-run rate stays at one cycle per period.
pub struct FixedPeriod {
    period: Duration,
    next: Instant,
}

impl FixedPeriod {
    pub fn new(period: Duration) -> Self {
        Self::starting_at(Instant::now(), period)
    }

    pub fn starting_at(start: Instant, period: Duration) -> Self {
        Self {
            period,
            next: start + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn next_deadline(&self) -> Instant {
        self.next
    }

    /// How long to sleep at `now` to hit the current deadline, then advance
    /// to the next one.
    pub fn delay_for(&mut self, now: Instant) -> Duration {
        let deadline = self.next;
        self.next += self.period;
        let delay = deadline.saturating_duration_since(now);
        if delay.is_zero() {
            log::trace!("Loop overran its deadline by {:?}", now - deadline);
        }
        delay
    }

    pub fn wait(&mut self) {
        let delay = self.delay_for(Instant::now());
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}
