// SPI sensor exchange: command -> settle -> read back -> reply
//
//   Start         decode request word, send command       wait spi send
//   AwaitSend     arm settle timer                        wait timeout
//   AwaitSettle   request the response word               wait spi receive
//   AwaitReceive  encode response into the reply          done
//
// Each step issues its side effect once, on entry; re-entries while the
// registered condition is pending only re-check it.

use log::{debug, trace};

use crate::codec::{CommandReader, ReplyWriter};
use crate::config::sensor;
use crate::drivers::peripherals::{Bus, BusId, Peripherals, completed};
use crate::kernel::continuation::{Continuation, Status};
use crate::kernel::plugin::{HandlerError, Plugin, TransactionState};
use crate::kernel::wait::WaitSet;
use crate::resume_points;

resume_points! {
    pub enum SpiStep {
        Start = 0,
        AwaitSend = 1,
        AwaitSettle = 2,
        AwaitReceive = 3,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiSensor {
    pub bus: BusId,
    pub opcode: u16,
    pub opcode_bits: u8,
    pub send_flags: u8,
    pub read_address: u16,
    pub read_address_bits: u8,
    /// Delay between the command and the read-back. 0 skips the timer.
    pub settle_ms: u32,
}

impl SpiSensor {
    pub const fn new(bus: BusId) -> Self {
        Self {
            bus,
            opcode: sensor::OPCODE,
            opcode_bits: sensor::OPCODE_BITS,
            send_flags: sensor::SEND_FLAGS,
            read_address: sensor::READ_ADDRESS,
            read_address_bits: sensor::READ_ADDRESS_BITS,
            settle_ms: sensor::SETTLE_MS,
        }
    }

    pub const fn with_settle_ms(mut self, ms: u32) -> Self {
        self.settle_ms = ms;
        self
    }
}

#[derive(Debug, Default, Clone)]
pub struct SpiSensorState {
    pub next: Continuation<SpiStep>,
    // must outlive the suspension between receive and reply
    pub response: u16,
}

impl TransactionState for SpiSensorState {
    fn resume_point(&self) -> u8 {
        self.next.raw()
    }

    fn reset(&mut self) {
        self.next.reset();
        self.response = 0;
    }
}

/// Completed exchanges on this bus, kept across transactions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpiSensorStats {
    pub completed: u32,
}

impl Plugin for SpiSensor {
    type State = SpiSensorState;
    type Persistent = SpiSensorStats;

    fn bus(&self) -> Bus {
        Bus::spi(self.bus.0)
    }

    fn resume<H: Peripherals>(
        &self,
        state: &mut SpiSensorState,
        stats: &mut SpiSensorStats,
        input: &mut CommandReader<'_>,
        output: &mut ReplyWriter<'_>,
        waits: &mut WaitSet,
        hw: &mut H,
    ) -> Result<Status, HandlerError> {
        let bus = self.bus;

        match state.next.point()? {
            SpiStep::Start => {
                let data = input.read_encoded_u16()?;
                debug!("spi{}: send {:#06x} opcode {:#06x}", bus, data, self.opcode);
                hw.start_spi_send(bus, self.opcode, self.opcode_bits, data, self.send_flags)?;
                waits.add_wait_for_spi_send(bus)?;
                Ok(state.next.suspend(SpiStep::AwaitSend))
            }

            SpiStep::AwaitSend => {
                if waits.is_waiting_for_spi_send(bus) {
                    return Ok(Status::Waiting);
                }
                match completed(hw.poll_spi_send(bus)) {
                    Some(r) => r?,
                    None => {
                        // engine still busy though the wait cleared
                        waits.add_wait_for_spi_send(bus)?;
                        return Ok(Status::Waiting);
                    }
                }
                if self.settle_ms == 0 {
                    return Ok(state.next.advance(SpiStep::AwaitSettle));
                }
                trace!("spi{}: settle {}ms", bus, self.settle_ms);
                waits.add_wait_for_timeout(self.settle_ms)?;
                Ok(state.next.suspend(SpiStep::AwaitSettle))
            }

            SpiStep::AwaitSettle => {
                if waits.is_waiting_for_timeout() {
                    return Ok(Status::Waiting);
                }
                state.response = 0;
                hw.start_spi_receive(bus, self.read_address, self.read_address_bits)?;
                waits.add_wait_for_spi_receive(bus)?;
                Ok(state.next.suspend(SpiStep::AwaitReceive))
            }

            SpiStep::AwaitReceive => {
                if waits.is_waiting_for_spi_receive(bus) {
                    return Ok(Status::Waiting);
                }
                state.response = match completed(hw.poll_spi_receive(bus)) {
                    Some(r) => r?,
                    None => {
                        waits.add_wait_for_spi_receive(bus)?;
                        return Ok(Status::Waiting);
                    }
                };
                output.write_encoded_u16(state.response)?;
                debug!("spi{}: response {:#06x}", bus, state.response);
                stats.completed = stats.completed.wrapping_add(1);
                Ok(state.next.finish())
            }
        }
    }

    fn abort<H: Peripherals>(&self, state: &mut SpiSensorState, hw: &mut H) {
        // only the send and receive steps have a bus operation in flight
        if let Ok(SpiStep::AwaitSend | SpiStep::AwaitReceive) = state.next.point() {
            hw.cancel(self.bus());
        }
        state.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;
    use crate::drivers::peripherals::BusError;
    use crate::drivers::sim::{Op, SimPeripherals};

    const BUS: BusId = BusId(0);

    struct Rig {
        plugin: SpiSensor,
        state: SpiSensorState,
        stats: SpiSensorStats,
        waits: WaitSet,
        hw: SimPeripherals,
        input: [u8; 3],
        input_len: usize,
        reply: [u8; 4],
        reply_len: usize,
        now: u32,
    }

    impl Rig {
        fn new(request: u16) -> Self {
            let mut input = [0u8; 3];
            let input_len = crate::codec::encode_u16(request, &mut input);
            Self {
                plugin: SpiSensor::new(BUS),
                state: SpiSensorState::default(),
                stats: SpiSensorStats::default(),
                waits: WaitSet::new(),
                hw: SimPeripherals::new(),
                input,
                input_len,
                reply: [0; 4],
                reply_len: 0,
                now: 0,
            }
        }

        fn resume(&mut self) -> Result<Status, HandlerError> {
            self.waits.refresh(&self.hw, self.now);
            let mut input = CommandReader::new(&self.input[..self.input_len]);
            let mut output = ReplyWriter::with_len(&mut self.reply, self.reply_len);
            let r = self.plugin.resume(
                &mut self.state,
                &mut self.stats,
                &mut input,
                &mut output,
                &mut self.waits,
                &mut self.hw,
            );
            self.reply_len = output.len();
            r
        }
    }

    #[test]
    fn issues_send_once_while_pending() {
        let mut rig = Rig::new(0x1234);
        assert_eq!(rig.resume(), Ok(Status::Waiting));
        assert_eq!(rig.resume(), Ok(Status::Waiting));
        assert_eq!(rig.resume(), Ok(Status::Waiting));
        assert_eq!(rig.state.next.point(), Ok(SpiStep::AwaitSend));
        assert_eq!(rig.hw.issued(), 1);
        assert!(rig.waits.is_waiting_for_spi_send(BUS));
    }

    #[test]
    fn settle_timer_holds_the_receive() {
        let mut rig = Rig::new(7);
        rig.resume().unwrap();
        rig.hw.complete(Bus::spi(0));
        assert_eq!(rig.resume(), Ok(Status::Waiting));
        assert_eq!(rig.state.next.point(), Ok(SpiStep::AwaitSettle));

        rig.now = 999;
        assert_eq!(rig.resume(), Ok(Status::Waiting));
        assert_eq!(rig.hw.issued(), 1);

        rig.now = 1000;
        assert_eq!(rig.resume(), Ok(Status::Waiting));
        assert_eq!(rig.state.next.point(), Ok(SpiStep::AwaitReceive));
        assert_eq!(
            rig.hw.ops().last(),
            Some(&Op::SpiReceive {
                bus: BUS,
                address: 0x0000,
                length: 0x08
            })
        );
    }

    #[test]
    fn zero_settle_yields_instead_of_waiting() {
        let mut rig = Rig::new(7);
        rig.plugin = SpiSensor::new(BUS).with_settle_ms(0);
        rig.resume().unwrap();
        rig.hw.complete(Bus::spi(0));
        assert_eq!(rig.resume(), Ok(Status::Yield));
        assert!(rig.waits.is_ready());
        assert_eq!(rig.resume(), Ok(Status::Waiting));
        assert_eq!(rig.state.next.point(), Ok(SpiStep::AwaitReceive));
    }

    #[test]
    fn send_failure_is_reported() {
        let mut rig = Rig::new(1);
        rig.resume().unwrap();
        rig.hw.fail(Bus::spi(0), BusError::Transfer);
        assert_eq!(rig.resume(), Err(HandlerError::Bus(BusError::Transfer)));
    }

    #[test]
    fn missing_input_fails_before_any_bus_traffic() {
        let mut rig = Rig::new(0);
        rig.input_len = 0;
        assert_eq!(rig.resume(), Err(HandlerError::Codec(CodecError::UnexpectedEnd)));
        assert_eq!(rig.hw.issued(), 0);
    }

    #[test]
    fn corrupt_resume_point_is_fatal() {
        let mut rig = Rig::new(1);
        rig.state.next.set_raw(9);
        let err = rig.resume().unwrap_err();
        assert_eq!(err, HandlerError::CorruptResumePoint(9));
        assert!(err.is_fatal());
        assert_eq!(rig.hw.issued(), 0);
    }

    #[test]
    fn abort_cancels_in_flight_receive() {
        let mut rig = Rig::new(1);
        rig.plugin = SpiSensor::new(BUS).with_settle_ms(0);
        rig.resume().unwrap();
        rig.hw.complete(Bus::spi(0));
        rig.resume().unwrap();
        rig.resume().unwrap();
        assert!(rig.hw.is_busy(Bus::spi(0)));

        rig.plugin.abort(&mut rig.state, &mut rig.hw);
        assert!(!rig.hw.is_busy(Bus::spi(0)));
        assert!(rig.state.next.is_initial());
        assert_eq!(rig.hw.ops().last(), Some(&Op::Cancel(Bus::spi(0))));
    }
}
