// I2C register sensor: write the request word to a command register,
// then read the result register back.
//
//   Start        decode request, write command register    wait i2c send
//   AwaitWrite   read result register                      wait i2c receive
//   AwaitRead    encode result into the reply              done

use log::debug;

use crate::codec::{CommandReader, ReplyWriter};
use crate::drivers::peripherals::{Bus, BusId, Peripherals, completed};
use crate::kernel::continuation::{Continuation, Status};
use crate::kernel::plugin::{HandlerError, Plugin, TransactionState};
use crate::kernel::wait::WaitSet;
use crate::resume_points;

resume_points! {
    pub enum I2cStep {
        Start = 0,
        AwaitWrite = 1,
        AwaitRead = 2,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I2cSensor {
    pub bus: BusId,
    pub address: u8,
    pub command_register: u8,
    pub result_register: u8,
}

#[derive(Debug, Default, Clone)]
pub struct I2cSensorState {
    pub next: Continuation<I2cStep>,
    pub result: u16,
}

impl TransactionState for I2cSensorState {
    fn resume_point(&self) -> u8 {
        self.next.raw()
    }

    fn reset(&mut self) {
        self.next.reset();
        self.result = 0;
    }
}

impl Plugin for I2cSensor {
    type State = I2cSensorState;
    type Persistent = ();

    fn bus(&self) -> Bus {
        Bus::i2c(self.bus.0)
    }

    fn resume<H: Peripherals>(
        &self,
        state: &mut I2cSensorState,
        _persistent: &mut (),
        input: &mut CommandReader<'_>,
        output: &mut ReplyWriter<'_>,
        waits: &mut WaitSet,
        hw: &mut H,
    ) -> Result<Status, HandlerError> {
        let bus = self.bus;

        match state.next.point()? {
            I2cStep::Start => {
                let request = input.read_encoded_u16()?;
                hw.start_i2c_send(bus, self.address, self.command_register, request)?;
                waits.add_wait_for_i2c_send(bus)?;
                Ok(state.next.suspend(I2cStep::AwaitWrite))
            }

            I2cStep::AwaitWrite => {
                if waits.is_waiting_for_i2c_send(bus) {
                    return Ok(Status::Waiting);
                }
                let Some(sent) = completed(hw.poll_i2c_send(bus)) else {
                    waits.add_wait_for_i2c_send(bus)?;
                    return Ok(Status::Waiting);
                };
                sent?;
                hw.start_i2c_receive(bus, self.address, self.result_register)?;
                waits.add_wait_for_i2c_receive(bus)?;
                Ok(state.next.suspend(I2cStep::AwaitRead))
            }

            I2cStep::AwaitRead => {
                if waits.is_waiting_for_i2c_receive(bus) {
                    return Ok(Status::Waiting);
                }
                state.result = match completed(hw.poll_i2c_receive(bus)) {
                    Some(r) => r?,
                    None => {
                        waits.add_wait_for_i2c_receive(bus)?;
                        return Ok(Status::Waiting);
                    }
                };
                output.write_encoded_u16(state.result)?;
                debug!("i2c{}@{:#04x}: result {:#06x}", bus, self.address, state.result);
                Ok(state.next.finish())
            }
        }
    }
}
