// Per-bus leases: at most one in-flight transaction per bus.
// Held from a transaction's first step until it finishes, fails or is
// aborted, so command and response cycles never interleave on a bus.

use core::fmt;

use crate::config::{MAX_I2C_BUSES, MAX_SPI_BUSES};
use crate::drivers::peripherals::{Bus, BusKind};
use crate::kernel::scheduler::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseError {
    Held(InstanceId),
    NoSuchBus,
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseError::Held(id) => write!(f, "bus held by {}", id),
            LeaseError::NoSuchBus => write!(f, "no such bus"),
        }
    }
}

pub struct BusLeases {
    spi: [Option<InstanceId>; MAX_SPI_BUSES],
    i2c: [Option<InstanceId>; MAX_I2C_BUSES],
}

impl BusLeases {
    pub const fn new() -> Self {
        Self {
            spi: [None; MAX_SPI_BUSES],
            i2c: [None; MAX_I2C_BUSES],
        }
    }

    fn slot(&mut self, bus: Bus) -> Option<&mut Option<InstanceId>> {
        match bus.kind {
            BusKind::Spi => self.spi.get_mut(bus.id.index()),
            BusKind::I2c => self.i2c.get_mut(bus.id.index()),
        }
    }

    pub fn holder(&self, bus: Bus) -> Option<InstanceId> {
        match bus.kind {
            BusKind::Spi => self.spi.get(bus.id.index()).copied().flatten(),
            BusKind::I2c => self.i2c.get(bus.id.index()).copied().flatten(),
        }
    }

    /// Take `bus` for `id`. Re-acquiring a lease already held is fine.
    pub fn try_acquire(&mut self, bus: Bus, id: InstanceId) -> Result<(), LeaseError> {
        let slot = self.slot(bus).ok_or(LeaseError::NoSuchBus)?;
        match *slot {
            Some(holder) if holder != id => Err(LeaseError::Held(holder)),
            _ => {
                *slot = Some(id);
                Ok(())
            }
        }
    }

    /// Give `bus` back. Only the holder can release; returns whether it did.
    pub fn release(&mut self, bus: Bus, id: InstanceId) -> bool {
        match self.slot(bus) {
            Some(slot) if *slot == Some(id) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

impl Default for BusLeases {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_holder_per_bus() {
        let mut leases = BusLeases::new();
        let a = InstanceId(0);
        let b = InstanceId(1);
        let bus = Bus::spi(0);

        leases.try_acquire(bus, a).unwrap();
        leases.try_acquire(bus, a).unwrap();
        assert_eq!(leases.try_acquire(bus, b), Err(LeaseError::Held(a)));

        // same id on a different bus kind is independent
        leases.try_acquire(Bus::i2c(0), b).unwrap();

        assert!(!leases.release(bus, b));
        assert!(leases.release(bus, a));
        assert_eq!(leases.holder(bus), None);
        leases.try_acquire(bus, b).unwrap();
    }

    #[test]
    fn out_of_range_bus() {
        let mut leases = BusLeases::new();
        let bus = Bus::spi(MAX_SPI_BUSES as u8);
        assert_eq!(leases.try_acquire(bus, InstanceId(0)), Err(LeaseError::NoSuchBus));
        assert!(!leases.release(bus, InstanceId(0)));
    }
}
