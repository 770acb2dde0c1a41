// Peripheral engine interface consumed by transaction handlers.
//
// Every start_* call is fire-and-forget. Completion is observed only
// through the poll_* queries, which follow the nb convention:
//   Err(WouldBlock)  still pending
//   Ok(..)           finished, result available
//   Err(Other(e))    finished with a bus error
// Polling never consumes the result; a new start_* on the same bus does.

use core::fmt;

/// Index of a bus within its kind (SPI bus 0, I2C bus 1, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(pub u8);

impl BusId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    Spi,
    I2c,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Spi => write!(f, "spi"),
            BusKind::I2c => write!(f, "i2c"),
        }
    }
}

/// A bus of a given kind; the unit the scheduler leases to one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bus {
    pub kind: BusKind,
    pub id: BusId,
}

impl Bus {
    pub const fn spi(id: u8) -> Self {
        Self {
            kind: BusKind::Spi,
            id: BusId(id),
        }
    }

    pub const fn i2c(id: u8) -> Self {
        Self {
            kind: BusKind::I2c,
            id: BusId(id),
        }
    }
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// Bus id outside the engine's range
    NoSuchBus,
    /// An operation is already in flight on this bus
    Busy,
    /// The underlying transfer failed
    Transfer,
    /// The operation was cancelled before completing
    Cancelled,
    /// Parameters the engine cannot express (e.g. odd bit widths)
    Unsupported,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::NoSuchBus => write!(f, "no such bus"),
            BusError::Busy => write!(f, "bus busy"),
            BusError::Transfer => write!(f, "transfer failed"),
            BusError::Cancelled => write!(f, "operation cancelled"),
            BusError::Unsupported => write!(f, "unsupported parameters"),
        }
    }
}

/// Bus engine: starts operations and answers "is it done yet?".
pub trait Peripherals {
    /// Send `opcode` (`length` bits wide) followed by `payload`.
    /// `flags` is engine-specific framing information.
    fn start_spi_send(
        &mut self,
        bus: BusId,
        opcode: u16,
        length: u8,
        payload: u16,
        flags: u8,
    ) -> Result<(), BusError>;

    /// Write `address` (`length` bits wide) and read back a 16-bit word.
    fn start_spi_receive(&mut self, bus: BusId, address: u16, length: u8) -> Result<(), BusError>;

    fn poll_spi_send(&self, bus: BusId) -> nb::Result<(), BusError>;

    fn poll_spi_receive(&self, bus: BusId) -> nb::Result<u16, BusError>;

    /// Write `payload` to `register` of the device at `address`.
    fn start_i2c_send(
        &mut self,
        bus: BusId,
        address: u8,
        register: u8,
        payload: u16,
    ) -> Result<(), BusError>;

    /// Read a 16-bit word from `register` of the device at `address`.
    fn start_i2c_receive(&mut self, bus: BusId, address: u8, register: u8)
    -> Result<(), BusError>;

    fn poll_i2c_send(&self, bus: BusId) -> nb::Result<(), BusError>;

    fn poll_i2c_receive(&self, bus: BusId) -> nb::Result<u16, BusError>;

    /// Drop whatever is in flight on `bus`. Idempotent.
    fn cancel(&mut self, bus: Bus);
}

/// Notifier view used by wait sets: is the last operation still pending?
#[inline]
pub fn is_pending<T, E>(r: nb::Result<T, E>) -> bool {
    matches!(r, Err(nb::Error::WouldBlock))
}

/// Finished result of a poll, or None while pending.
#[inline]
pub fn completed<T, E>(r: nb::Result<T, E>) -> Option<Result<T, E>> {
    match r {
        Err(nb::Error::WouldBlock) => None,
        Err(nb::Error::Other(e)) => Some(Err(e)),
        Ok(v) => Some(Ok(v)),
    }
}
