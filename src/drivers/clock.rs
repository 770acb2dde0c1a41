// Millisecond time sources for timeout waits.
// Time is a wrapping u32; compare with deadline_reached(), never `<`.

use crate::config::BASE_TICK_MS;
use crate::kernel::wake;

pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// Uptime counted by the timer interrupt (see wake::signal_timer).
#[derive(Debug, Default, Clone, Copy)]
pub struct UptimeClock;

impl Clock for UptimeClock {
    fn now_ms(&self) -> u32 {
        wake::uptime_ticks().wrapping_mul(BASE_TICK_MS)
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualClock {
    now: u32,
}

impl ManualClock {
    pub const fn new(start_ms: u32) -> Self {
        Self { now: start_ms }
    }

    pub fn advance(&mut self, ms: u32) {
        self.now = self.now.wrapping_add(ms);
    }

    pub fn set(&mut self, ms: u32) {
        self.now = ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now
    }
}

/// True once `now` is at or past `deadline`, tolerating one wrap.
#[inline]
pub fn deadline_reached(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) < (1 << 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_across_wrap() {
        let deadline = 5u32;
        assert!(!deadline_reached(u32::MAX - 10, deadline));
        assert!(deadline_reached(5, deadline));
        assert!(deadline_reached(6, deadline));
    }

    #[test]
    fn manual_clock_wraps() {
        let mut c = ManualClock::new(u32::MAX);
        c.advance(2);
        assert_eq!(c.now_ms(), 1);
    }
}
