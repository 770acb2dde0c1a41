// Scripted peripheral engine
// Operations stay pending until the test (or demo loop) completes them.
// Every start_* and cancel is appended to a fixed-size log so callers
// can check what was issued, how often, and in which order.

use log::debug;

use crate::config::{MAX_I2C_BUSES, MAX_SPI_BUSES};
use crate::drivers::peripherals::{Bus, BusError, BusId, BusKind, Peripherals};

pub const OP_LOG_CAP: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    SpiSend {
        bus: BusId,
        opcode: u16,
        length: u8,
        payload: u16,
        flags: u8,
    },
    SpiReceive {
        bus: BusId,
        address: u16,
        length: u8,
    },
    I2cSend {
        bus: BusId,
        address: u8,
        register: u8,
        payload: u16,
    },
    I2cReceive {
        bus: BusId,
        address: u8,
        register: u8,
    },
    Cancel(Bus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line {
    Idle,
    Sending,
    Receiving,
    Sent(Result<(), BusError>),
    Received(Result<u16, BusError>),
}

impl Line {
    fn is_pending(self) -> bool {
        matches!(self, Line::Sending | Line::Receiving)
    }

    fn poll_send(self) -> nb::Result<(), BusError> {
        match self {
            Line::Sending => Err(nb::Error::WouldBlock),
            Line::Sent(r) => r.map_err(nb::Error::Other),
            // nothing of that kind in flight (never started or cancelled)
            _ => Err(nb::Error::Other(BusError::Cancelled)),
        }
    }

    fn poll_receive(self) -> nb::Result<u16, BusError> {
        match self {
            Line::Receiving => Err(nb::Error::WouldBlock),
            Line::Received(r) => r.map_err(nb::Error::Other),
            _ => Err(nb::Error::Other(BusError::Cancelled)),
        }
    }
}

pub struct SimPeripherals {
    spi: [Line; MAX_SPI_BUSES],
    i2c: [Line; MAX_I2C_BUSES],
    // value handed back by complete() for pending receives
    spi_reply: [u16; MAX_SPI_BUSES],
    i2c_reply: [u16; MAX_I2C_BUSES],
    log: [Option<Op>; OP_LOG_CAP],
    issued: usize,
}

impl SimPeripherals {
    pub const fn new() -> Self {
        Self {
            spi: [Line::Idle; MAX_SPI_BUSES],
            i2c: [Line::Idle; MAX_I2C_BUSES],
            spi_reply: [0; MAX_SPI_BUSES],
            i2c_reply: [0; MAX_I2C_BUSES],
            log: [None; OP_LOG_CAP],
            issued: 0,
        }
    }

    fn line(&self, bus: Bus) -> Option<Line> {
        match bus.kind {
            BusKind::Spi => self.spi.get(bus.id.index()).copied(),
            BusKind::I2c => self.i2c.get(bus.id.index()).copied(),
        }
    }

    fn line_mut(&mut self, bus: Bus) -> Result<&mut Line, BusError> {
        match bus.kind {
            BusKind::Spi => self.spi.get_mut(bus.id.index()),
            BusKind::I2c => self.i2c.get_mut(bus.id.index()),
        }
        .ok_or(BusError::NoSuchBus)
    }

    fn begin(&mut self, bus: Bus, next: Line, op: Op) -> Result<(), BusError> {
        let line = self.line_mut(bus)?;
        if line.is_pending() {
            return Err(BusError::Busy);
        }
        *line = next;
        self.record(op);
        Ok(())
    }

    fn record(&mut self, op: Op) {
        debug!("sim: {:?}", op);
        if let Some(slot) = self.log.get_mut(self.issued) {
            *slot = Some(op);
        }
        self.issued += 1;
    }

    /// Value the next completed receive on `bus` yields.
    pub fn set_reply(&mut self, bus: Bus, value: u16) {
        let slot = match bus.kind {
            BusKind::Spi => self.spi_reply.get_mut(bus.id.index()),
            BusKind::I2c => self.i2c_reply.get_mut(bus.id.index()),
        };
        if let Some(slot) = slot {
            *slot = value;
        }
    }

    /// Finish whatever is pending on `bus` successfully. Returns false if
    /// nothing was pending.
    pub fn complete(&mut self, bus: Bus) -> bool {
        let reply = match bus.kind {
            BusKind::Spi => self.spi_reply.get(bus.id.index()).copied(),
            BusKind::I2c => self.i2c_reply.get(bus.id.index()).copied(),
        }
        .unwrap_or(0);
        let Ok(line) = self.line_mut(bus) else {
            return false;
        };
        match *line {
            Line::Sending => *line = Line::Sent(Ok(())),
            Line::Receiving => *line = Line::Received(Ok(reply)),
            _ => return false,
        }
        true
    }

    pub fn complete_receive(&mut self, bus: Bus, value: u16) -> bool {
        self.set_reply(bus, value);
        self.complete(bus)
    }

    /// Finish whatever is pending on `bus` with `err`.
    pub fn fail(&mut self, bus: Bus, err: BusError) -> bool {
        let Ok(line) = self.line_mut(bus) else {
            return false;
        };
        match *line {
            Line::Sending => *line = Line::Sent(Err(err)),
            Line::Receiving => *line = Line::Received(Err(err)),
            _ => return false,
        }
        true
    }

    /// Complete every pending operation; what a real engine's ISR does
    /// over time.
    pub fn complete_all(&mut self) -> usize {
        let mut n = 0;
        for id in 0..MAX_SPI_BUSES {
            n += self.complete(Bus::spi(id as u8)) as usize;
        }
        for id in 0..MAX_I2C_BUSES {
            n += self.complete(Bus::i2c(id as u8)) as usize;
        }
        n
    }

    pub fn is_busy(&self, bus: Bus) -> bool {
        self.line(bus).is_some_and(Line::is_pending)
    }

    /// Operations issued so far, oldest first (capped at OP_LOG_CAP).
    pub fn ops(&self) -> impl Iterator<Item = &Op> {
        self.log.iter().filter_map(|o| o.as_ref())
    }

    /// Total operations issued, including ones past the log cap.
    pub fn issued(&self) -> usize {
        self.issued
    }

    pub fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.ops().filter(|o| pred(o)).count()
    }

    pub fn clear_log(&mut self) {
        self.log = [None; OP_LOG_CAP];
        self.issued = 0;
    }
}

impl Default for SimPeripherals {
    fn default() -> Self {
        Self::new()
    }
}

impl Peripherals for SimPeripherals {
    fn start_spi_send(
        &mut self,
        bus: BusId,
        opcode: u16,
        length: u8,
        payload: u16,
        flags: u8,
    ) -> Result<(), BusError> {
        let op = Op::SpiSend {
            bus,
            opcode,
            length,
            payload,
            flags,
        };
        self.begin(Bus::spi(bus.0), Line::Sending, op)
    }

    fn start_spi_receive(&mut self, bus: BusId, address: u16, length: u8) -> Result<(), BusError> {
        let op = Op::SpiReceive {
            bus,
            address,
            length,
        };
        self.begin(Bus::spi(bus.0), Line::Receiving, op)
    }

    fn poll_spi_send(&self, bus: BusId) -> nb::Result<(), BusError> {
        self.line(Bus::spi(bus.0))
            .ok_or(nb::Error::Other(BusError::NoSuchBus))?
            .poll_send()
    }

    fn poll_spi_receive(&self, bus: BusId) -> nb::Result<u16, BusError> {
        self.line(Bus::spi(bus.0))
            .ok_or(nb::Error::Other(BusError::NoSuchBus))?
            .poll_receive()
    }

    fn start_i2c_send(
        &mut self,
        bus: BusId,
        address: u8,
        register: u8,
        payload: u16,
    ) -> Result<(), BusError> {
        let op = Op::I2cSend {
            bus,
            address,
            register,
            payload,
        };
        self.begin(Bus::i2c(bus.0), Line::Sending, op)
    }

    fn start_i2c_receive(
        &mut self,
        bus: BusId,
        address: u8,
        register: u8,
    ) -> Result<(), BusError> {
        let op = Op::I2cReceive {
            bus,
            address,
            register,
        };
        self.begin(Bus::i2c(bus.0), Line::Receiving, op)
    }

    fn poll_i2c_send(&self, bus: BusId) -> nb::Result<(), BusError> {
        self.line(Bus::i2c(bus.0))
            .ok_or(nb::Error::Other(BusError::NoSuchBus))?
            .poll_send()
    }

    fn poll_i2c_receive(&self, bus: BusId) -> nb::Result<u16, BusError> {
        self.line(Bus::i2c(bus.0))
            .ok_or(nb::Error::Other(BusError::NoSuchBus))?
            .poll_receive()
    }

    fn cancel(&mut self, bus: Bus) {
        if let Ok(line) = self.line_mut(bus) {
            if line.is_pending() {
                *line = Line::Idle;
                self.record(Op::Cancel(bus));
            }
        }
    }
}
