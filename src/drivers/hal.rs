// Peripheral engine over embedded-hal blocking buses
//
// start_* only queue a request; service() performs the queued transfers
// with the blocking SpiDevice / I2c traits, records the result and
// raises the bus wake flag. Call service() from the main loop (or a
// low-priority interrupt) so handlers never block on the bus.
//
// SPI send frame:    opcode (length bits, BE) | payload (flags & 0x0F bytes, BE)
// SPI receive frame: address (length bits, BE) then read 2 bytes, BE
// I2C send:          [register, payload_hi, payload_lo]
// I2C receive:       write [register], read 2 bytes, BE

use core::convert::Infallible;

use embedded_hal::i2c::{self, I2c};
use embedded_hal::spi::{self, Operation, SpiDevice};
use log::{debug, warn};

use crate::drivers::peripherals::{Bus, BusError, BusId, BusKind, Peripherals};
use crate::kernel::wake;

const PAYLOAD_LEN_MASK: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    SpiSend { opcode: u16, length: u8, payload: u16, flags: u8 },
    SpiReceive { address: u16, length: u8 },
    I2cSend { address: u8, register: u8, payload: u16 },
    I2cReceive { address: u8, register: u8 },
}

impl Request {
    fn is_send(self) -> bool {
        matches!(self, Request::SpiSend { .. } | Request::I2cSend { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line {
    Idle,
    Queued(Request),
    Sent(Result<(), BusError>),
    Received(Result<u16, BusError>),
}

impl Line {
    fn poll_send(self) -> nb::Result<(), BusError> {
        match self {
            Line::Queued(r) if r.is_send() => Err(nb::Error::WouldBlock),
            Line::Sent(r) => r.map_err(nb::Error::Other),
            _ => Err(nb::Error::Other(BusError::Cancelled)),
        }
    }

    fn poll_receive(self) -> nb::Result<u16, BusError> {
        match self {
            Line::Queued(r) if !r.is_send() => Err(nb::Error::WouldBlock),
            Line::Received(r) => r.map_err(nb::Error::Other),
            _ => Err(nb::Error::Other(BusError::Cancelled)),
        }
    }
}

// bit width -> byte count, whole bytes only, at most 16 bits
fn width_bytes(bits: u8) -> Result<usize, BusError> {
    match bits {
        0 | 8 | 16 => Ok(bits as usize / 8),
        _ => Err(BusError::Unsupported),
    }
}

// low `n` bytes of `v`, big-endian
fn be_bytes(v: u16, n: usize, out: &mut [u8]) {
    let b = v.to_be_bytes();
    out[..n].copy_from_slice(&b[2 - n..]);
}

/// Placeholder device for boards without one of the bus kinds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBus;

impl spi::ErrorType for NoBus {
    type Error = Infallible;
}

impl SpiDevice for NoBus {
    fn transaction(&mut self, _operations: &mut [Operation<'_, u8>]) -> Result<(), Infallible> {
        Ok(())
    }
}

impl i2c::ErrorType for NoBus {
    type Error = Infallible;
}

impl I2c for NoBus {
    fn transaction(
        &mut self,
        _address: u8,
        _operations: &mut [i2c::Operation<'_>],
    ) -> Result<(), Infallible> {
        Ok(())
    }
}

pub struct HalPeripherals<SPI, I2C, const NS: usize, const NI: usize> {
    spi: [SPI; NS],
    i2c: [I2C; NI],
    spi_lines: [Line; NS],
    i2c_lines: [Line; NI],
}

impl<SPI, const NS: usize> HalPeripherals<SPI, NoBus, NS, 0>
where
    SPI: SpiDevice,
{
    pub fn spi_only(spi: [SPI; NS]) -> Self {
        Self::new(spi, [])
    }
}

impl<SPI, I2C, const NS: usize, const NI: usize> HalPeripherals<SPI, I2C, NS, NI>
where
    SPI: SpiDevice,
    I2C: I2c,
{
    pub fn new(spi: [SPI; NS], i2c: [I2C; NI]) -> Self {
        Self {
            spi,
            i2c,
            spi_lines: [Line::Idle; NS],
            i2c_lines: [Line::Idle; NI],
        }
    }

    pub fn release(self) -> ([SPI; NS], [I2C; NI]) {
        (self.spi, self.i2c)
    }

    fn line(&self, bus: Bus) -> Option<Line> {
        match bus.kind {
            BusKind::Spi => self.spi_lines.get(bus.id.index()).copied(),
            BusKind::I2c => self.i2c_lines.get(bus.id.index()).copied(),
        }
    }

    fn queue(&mut self, bus: Bus, req: Request) -> Result<(), BusError> {
        let line = match bus.kind {
            BusKind::Spi => self.spi_lines.get_mut(bus.id.index()),
            BusKind::I2c => self.i2c_lines.get_mut(bus.id.index()),
        }
        .ok_or(BusError::NoSuchBus)?;
        if matches!(line, Line::Queued(_)) {
            return Err(BusError::Busy);
        }
        *line = Line::Queued(req);
        Ok(())
    }

    /// Run every queued transfer. Returns the number completed.
    pub fn service(&mut self) -> usize {
        let mut done = 0;
        for idx in 0..NS {
            if let Line::Queued(req) = self.spi_lines[idx] {
                self.spi_lines[idx] = run_spi(&mut self.spi[idx], req);
                debug!("spi{}: {:?} -> {:?}", idx, req, self.spi_lines[idx]);
                wake::signal_bus(Bus::spi(idx as u8));
                done += 1;
            }
        }
        for idx in 0..NI {
            if let Line::Queued(req) = self.i2c_lines[idx] {
                self.i2c_lines[idx] = run_i2c(&mut self.i2c[idx], req);
                debug!("i2c{}: {:?} -> {:?}", idx, req, self.i2c_lines[idx]);
                wake::signal_bus(Bus::i2c(idx as u8));
                done += 1;
            }
        }
        done
    }

    pub fn has_queued(&self) -> bool {
        self.spi_lines
            .iter()
            .chain(self.i2c_lines.iter())
            .any(|l| matches!(l, Line::Queued(_)))
    }
}

fn run_spi<SPI: SpiDevice>(dev: &mut SPI, req: Request) -> Line {
    match req {
        Request::SpiSend {
            opcode,
            length,
            payload,
            flags,
        } => {
            let op_len = length as usize / 8;
            let payload_len = (flags & PAYLOAD_LEN_MASK) as usize;
            let mut frame = [0u8; 4];
            be_bytes(opcode, op_len, &mut frame);
            be_bytes(payload, payload_len, &mut frame[op_len..]);
            Line::Sent(
                dev.write(&frame[..op_len + payload_len])
                    .map_err(spi_failed),
            )
        }
        Request::SpiReceive { address, length } => {
            let addr_len = length as usize / 8;
            let mut addr = [0u8; 2];
            be_bytes(address, addr_len, &mut addr);
            let mut rx = [0u8; 2];
            let r = dev
                .transaction(&mut [Operation::Write(&addr[..addr_len]), Operation::Read(&mut rx)])
                .map_err(spi_failed);
            Line::Received(r.map(|()| u16::from_be_bytes(rx)))
        }
        _ => Line::Idle,
    }
}

fn run_i2c<I2C: I2c>(dev: &mut I2C, req: Request) -> Line {
    match req {
        Request::I2cSend {
            address,
            register,
            payload,
        } => {
            let [hi, lo] = payload.to_be_bytes();
            Line::Sent(dev.write(address, &[register, hi, lo]).map_err(i2c_failed))
        }
        Request::I2cReceive { address, register } => {
            let mut rx = [0u8; 2];
            let r = dev.write_read(address, &[register], &mut rx).map_err(i2c_failed);
            Line::Received(r.map(|()| u16::from_be_bytes(rx)))
        }
        _ => Line::Idle,
    }
}

fn spi_failed<E: spi::Error>(e: E) -> BusError {
    warn!("spi transfer failed: {:?}", e.kind());
    BusError::Transfer
}

fn i2c_failed<E: i2c::Error>(e: E) -> BusError {
    warn!("i2c transfer failed: {:?}", e.kind());
    BusError::Transfer
}

impl<SPI, I2C, const NS: usize, const NI: usize> Peripherals for HalPeripherals<SPI, I2C, NS, NI>
where
    SPI: SpiDevice,
    I2C: I2c,
{
    fn start_spi_send(
        &mut self,
        bus: BusId,
        opcode: u16,
        length: u8,
        payload: u16,
        flags: u8,
    ) -> Result<(), BusError> {
        width_bytes(length)?;
        if flags & PAYLOAD_LEN_MASK > 2 {
            return Err(BusError::Unsupported);
        }
        let req = Request::SpiSend {
            opcode,
            length,
            payload,
            flags,
        };
        self.queue(Bus::spi(bus.0), req)
    }

    fn start_spi_receive(&mut self, bus: BusId, address: u16, length: u8) -> Result<(), BusError> {
        width_bytes(length)?;
        self.queue(Bus::spi(bus.0), Request::SpiReceive { address, length })
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
        let req = Request::I2cSend {
            address,
            register,
            payload,
        };
        self.queue(Bus::i2c(bus.0), req)
    }

    fn start_i2c_receive(
        &mut self,
        bus: BusId,
        address: u8,
        register: u8,
    ) -> Result<(), BusError> {
        self.queue(Bus::i2c(bus.0), Request::I2cReceive { address, register })
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
        let line = match bus.kind {
            BusKind::Spi => self.spi_lines.get_mut(bus.id.index()),
            BusKind::I2c => self.i2c_lines.get_mut(bus.id.index()),
        };
        if let Some(line) = line {
            if matches!(line, Line::Queued(_)) {
                debug!("{}: cancelled queued transfer", bus);
                *line = Line::Idle;
            }
        }
    }
}
