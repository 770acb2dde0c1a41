// Wait set: the conditions one instance is suspended on.
//
// A handler registers conditions right before returning Waiting; the
// scheduler refreshes the set against the peripheral engine and clock
// before the next call, pruning whatever has completed. On re-entry
// the handler just asks "am I still waiting for X?" and needs nothing
// beyond its resume point to know what X is.

use core::fmt;

use crate::config::MAX_WAITS;
use crate::drivers::clock::deadline_reached;
use crate::drivers::peripherals::{Bus, BusId, Peripherals, is_pending};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    SpiSend(BusId),
    SpiReceive(BusId),
    I2cSend(BusId),
    I2cReceive(BusId),
    /// Absolute deadline in clock milliseconds
    Timeout { deadline: u32 },
}

impl Wait {
    /// The bus whose completion clears this condition; None for timers.
    pub fn bus(&self) -> Option<Bus> {
        match *self {
            Wait::SpiSend(id) | Wait::SpiReceive(id) => Some(Bus::spi(id.0)),
            Wait::I2cSend(id) | Wait::I2cReceive(id) => Some(Bus::i2c(id.0)),
            Wait::Timeout { .. } => None,
        }
    }

    fn still_pending<H: Peripherals>(&self, hw: &H, now: u32) -> bool {
        match *self {
            Wait::SpiSend(bus) => is_pending(hw.poll_spi_send(bus)),
            Wait::SpiReceive(bus) => is_pending(hw.poll_spi_receive(bus)),
            Wait::I2cSend(bus) => is_pending(hw.poll_i2c_send(bus)),
            Wait::I2cReceive(bus) => is_pending(hw.poll_i2c_receive(bus)),
            Wait::Timeout { deadline } => !deadline_reached(now, deadline),
        }
    }
}

impl fmt::Display for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wait::SpiSend(bus) => write!(f, "spi{} send", bus),
            Wait::SpiReceive(bus) => write!(f, "spi{} receive", bus),
            Wait::I2cSend(bus) => write!(f, "i2c{} send", bus),
            Wait::I2cReceive(bus) => write!(f, "i2c{} receive", bus),
            Wait::Timeout { deadline } => write!(f, "timeout @{}ms", deadline),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// More than MAX_WAITS distinct conditions registered
    Full,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Full => write!(f, "wait set full ({} conditions)", MAX_WAITS),
        }
    }
}

pub struct WaitSet {
    waits: [Option<Wait>; MAX_WAITS],
    len: usize,
    // clock reading at the last refresh; base for relative timeouts
    now: u32,
}

impl WaitSet {
    pub const fn new() -> Self {
        Self {
            waits: [None; MAX_WAITS],
            len: 0,
            now: 0,
        }
    }

    pub fn now_ms(&self) -> u32 {
        self.now
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Nothing left to wait for; the handler should be re-invoked.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Wait> {
        self.waits.iter().filter_map(|w| w.as_ref())
    }

    pub fn contains(&self, wait: &Wait) -> bool {
        self.iter().any(|w| w == wait)
    }

    /// Drop every condition and the time base; the next refresh sets a
    /// new one.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn add(&mut self, wait: Wait) -> Result<(), WaitError> {
        if self.contains(&wait) {
            return Ok(());
        }
        let slot = self
            .waits
            .iter_mut()
            .find(|w| w.is_none())
            .ok_or(WaitError::Full)?;
        *slot = Some(wait);
        self.len += 1;
        Ok(())
    }

    pub fn add_wait_for_spi_send(&mut self, bus: BusId) -> Result<(), WaitError> {
        self.add(Wait::SpiSend(bus))
    }

    pub fn add_wait_for_spi_receive(&mut self, bus: BusId) -> Result<(), WaitError> {
        self.add(Wait::SpiReceive(bus))
    }

    pub fn add_wait_for_i2c_send(&mut self, bus: BusId) -> Result<(), WaitError> {
        self.add(Wait::I2cSend(bus))
    }

    pub fn add_wait_for_i2c_receive(&mut self, bus: BusId) -> Result<(), WaitError> {
        self.add(Wait::I2cReceive(bus))
    }

    /// Arm a timer `duration_ms` after the last refresh.
    pub fn add_wait_for_timeout(&mut self, duration_ms: u32) -> Result<(), WaitError> {
        let deadline = self.now.wrapping_add(duration_ms);
        self.add(Wait::Timeout { deadline })
    }

    pub fn is_waiting_for_spi_send(&self, bus: BusId) -> bool {
        self.contains(&Wait::SpiSend(bus))
    }

    pub fn is_waiting_for_spi_receive(&self, bus: BusId) -> bool {
        self.contains(&Wait::SpiReceive(bus))
    }

    pub fn is_waiting_for_i2c_send(&self, bus: BusId) -> bool {
        self.contains(&Wait::I2cSend(bus))
    }

    pub fn is_waiting_for_i2c_receive(&self, bus: BusId) -> bool {
        self.contains(&Wait::I2cReceive(bus))
    }

    pub fn is_waiting_for_timeout(&self) -> bool {
        self.iter().any(|w| matches!(w, Wait::Timeout { .. }))
    }

    /// Earliest armed timer, for sizing the idle sleep.
    pub fn next_deadline(&self) -> Option<u32> {
        self.iter()
            .filter_map(|w| match *w {
                Wait::Timeout { deadline } => Some(deadline),
                _ => None,
            })
            .min_by_key(|d| d.wrapping_sub(self.now))
    }

    /// Re-query every condition, dropping the ones that have cleared.
    /// Returns how many were dropped.
    pub fn refresh<H: Peripherals>(&mut self, hw: &H, now: u32) -> usize {
        self.now = now;
        let mut cleared = 0;
        for slot in self.waits.iter_mut() {
            if slot.is_some_and(|w| !w.still_pending(hw, now)) {
                *slot = None;
                cleared += 1;
            }
        }
        self.len -= cleared;
        cleared
    }
}

impl Default for WaitSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::sim::SimPeripherals;

    const B0: BusId = BusId(0);
    const B1: BusId = BusId(1);

    #[test]
    fn predicates_on_empty_set() {
        let w = WaitSet::new();
        assert!(w.is_ready());
        assert!(!w.is_waiting_for_spi_send(B0));
        assert!(!w.is_waiting_for_spi_receive(B0));
        assert!(!w.is_waiting_for_i2c_send(B0));
        assert!(!w.is_waiting_for_i2c_receive(B0));
        assert!(!w.is_waiting_for_timeout());
        assert_eq!(w.next_deadline(), None);
    }

    #[test]
    fn registration_is_additive_and_deduplicated() {
        let mut w = WaitSet::new();
        w.add_wait_for_spi_send(B0).unwrap();
        w.add_wait_for_spi_receive(B1).unwrap();
        w.add_wait_for_spi_send(B0).unwrap();
        assert_eq!(w.len(), 2);
        assert!(w.is_waiting_for_spi_send(B0));
        assert!(!w.is_waiting_for_spi_send(B1));
        assert!(w.is_waiting_for_spi_receive(B1));
    }

    #[test]
    fn capacity_is_bounded() {
        let mut w = WaitSet::new();
        for i in 0..MAX_WAITS {
            w.add_wait_for_i2c_send(BusId(i as u8)).unwrap();
        }
        assert_eq!(w.add_wait_for_timeout(1), Err(WaitError::Full));
        assert_eq!(w.len(), MAX_WAITS);
    }

    #[test]
    fn refresh_prunes_completed_conditions() {
        let mut hw = SimPeripherals::new();
        hw.start_spi_send(B0, 0x03, 8, 0, 2).unwrap();

        let mut w = WaitSet::new();
        w.add_wait_for_spi_send(B0).unwrap();
        w.add_wait_for_timeout(100).unwrap();

        assert_eq!(w.refresh(&hw, 50), 0);
        assert_eq!(w.len(), 2);

        hw.complete(Bus::spi(0));
        assert_eq!(w.refresh(&hw, 60), 1);
        assert!(!w.is_waiting_for_spi_send(B0));
        assert!(w.is_waiting_for_timeout());

        assert_eq!(w.refresh(&hw, 100), 1);
        assert!(w.is_ready());
    }

    #[test]
    fn timeout_is_relative_to_last_refresh() {
        let hw = SimPeripherals::new();
        let mut w = WaitSet::new();
        w.refresh(&hw, u32::MAX - 5);
        w.add_wait_for_timeout(10).unwrap();
        assert_eq!(w.next_deadline(), Some(4));

        w.refresh(&hw, 3);
        assert!(w.is_waiting_for_timeout());
        w.refresh(&hw, 4);
        assert!(!w.is_waiting_for_timeout());
    }

    #[test]
    fn clear_drops_the_time_base() {
        let hw = SimPeripherals::new();
        let mut w = WaitSet::new();
        w.refresh(&hw, 700);
        w.add_wait_for_timeout(10).unwrap();
        w.clear();
        assert!(w.is_ready());
        assert_eq!(w.now_ms(), 0);

        w.refresh(&hw, 9_000);
        w.add_wait_for_timeout(10).unwrap();
        assert_eq!(w.next_deadline(), Some(9_010));
    }

    #[test]
    fn conditions_name_their_bus() {
        assert_eq!(Wait::SpiReceive(B1).bus(), Some(Bus::spi(1)));
        assert_eq!(Wait::I2cSend(B0).bus(), Some(Bus::i2c(0)));
        assert_eq!(Wait::Timeout { deadline: 5 }.bus(), None);
    }

    #[test]
    fn unknown_operations_do_not_block() {
        // nothing was started on bus 1, so there is nothing to wait for
        let hw = SimPeripherals::new();
        let mut w = WaitSet::new();
        w.add_wait_for_spi_receive(B1).unwrap();
        w.refresh(&hw, 0);
        assert!(w.is_ready());
    }
}
