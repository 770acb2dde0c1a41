// Any configured sensor, so SPI and I2C plugins can share one registry.
// Dispatches to the concrete plugin by variant, no dyn.

use crate::codec::{CommandReader, ReplyWriter};
use crate::drivers::peripherals::{Bus, Peripherals};
use crate::kernel::continuation::Status;
use crate::kernel::plugin::{HandlerError, Plugin, TransactionState};
use crate::kernel::wait::WaitSet;
use crate::plugins::i2c_sensor::{I2cSensor, I2cSensorState};
use crate::plugins::spi_sensor::{SpiSensor, SpiSensorState, SpiSensorStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Spi(SpiSensor),
    I2c(I2cSensor),
}

impl From<SpiSensor> for Sensor {
    fn from(s: SpiSensor) -> Self {
        Sensor::Spi(s)
    }
}

impl From<I2cSensor> for Sensor {
    fn from(s: I2cSensor) -> Self {
        Sensor::I2c(s)
    }
}

/// Transaction state of whichever sensor owns the slot; `init` picks the
/// variant.
#[derive(Debug, Clone)]
pub enum SensorState {
    Spi(SpiSensorState),
    I2c(I2cSensorState),
}

impl Default for SensorState {
    fn default() -> Self {
        SensorState::Spi(SpiSensorState::default())
    }
}

impl TransactionState for SensorState {
    fn resume_point(&self) -> u8 {
        match self {
            SensorState::Spi(s) => s.resume_point(),
            SensorState::I2c(s) => s.resume_point(),
        }
    }

    fn reset(&mut self) {
        match self {
            SensorState::Spi(s) => s.reset(),
            SensorState::I2c(s) => s.reset(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SensorStats {
    pub spi: SpiSensorStats,
}

impl Plugin for Sensor {
    type State = SensorState;
    type Persistent = SensorStats;

    fn bus(&self) -> Bus {
        match self {
            Sensor::Spi(p) => p.bus(),
            Sensor::I2c(p) => p.bus(),
        }
    }

    fn init(&self, state: &mut SensorState) -> Result<(), HandlerError> {
        *state = match self {
            Sensor::Spi(p) => {
                let mut s = SpiSensorState::default();
                p.init(&mut s)?;
                SensorState::Spi(s)
            }
            Sensor::I2c(p) => {
                let mut s = I2cSensorState::default();
                p.init(&mut s)?;
                SensorState::I2c(s)
            }
        };
        Ok(())
    }

    fn handler_init(&self, stats: &mut SensorStats) -> Result<(), HandlerError> {
        match self {
            Sensor::Spi(p) => p.handler_init(&mut stats.spi),
            Sensor::I2c(p) => p.handler_init(&mut ()),
        }
    }

    fn resume<H: Peripherals>(
        &self,
        state: &mut SensorState,
        stats: &mut SensorStats,
        input: &mut CommandReader<'_>,
        output: &mut ReplyWriter<'_>,
        waits: &mut WaitSet,
        hw: &mut H,
    ) -> Result<Status, HandlerError> {
        match (self, state) {
            (Sensor::Spi(p), SensorState::Spi(s)) => {
                p.resume(s, &mut stats.spi, input, output, waits, hw)
            }
            (Sensor::I2c(p), SensorState::I2c(s)) => p.resume(s, &mut (), input, output, waits, hw),
            // state belongs to the other kind of sensor
            (_, s) => Err(HandlerError::CorruptResumePoint(s.resume_point())),
        }
    }

    fn abort<H: Peripherals>(&self, state: &mut SensorState, hw: &mut H) {
        match (self, state) {
            (Sensor::Spi(p), SensorState::Spi(s)) => p.abort(s, hw),
            (Sensor::I2c(p), SensorState::I2c(s)) => p.abort(s, hw),
            (p, s) => {
                hw.cancel(p.bus());
                s.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::peripherals::BusId;
    use crate::drivers::sim::{Op, SimPeripherals};
    use crate::kernel::scheduler::{Outcome, Phase, Scheduler, SchedulerConfig};

    fn thermometer() -> I2cSensor {
        I2cSensor {
            bus: BusId(0),
            address: 0x48,
            command_register: 0x01,
            result_register: 0x00,
        }
    }

    #[test]
    fn spi_and_i2c_share_a_scheduler() {
        let mut sched: Scheduler<Sensor, 4> = Scheduler::new(SchedulerConfig::default());
        let mut hw = SimPeripherals::new();
        let spi = sched
            .register(SpiSensor::new(BusId(0)).with_settle_ms(0).into())
            .unwrap();
        let i2c = sched.register(thermometer().into()).unwrap();

        let a = sched.submit(spi, &[0x01]).unwrap();
        let b = sched.submit(i2c, &[0x02]).unwrap();

        // different buses: both start on the first tick
        sched.tick(&mut hw, 0);
        assert_eq!(sched.phase(a), Some(Phase::Running));
        assert_eq!(sched.phase(b), Some(Phase::Running));
        assert_eq!(hw.issued(), 2);

        hw.set_reply(Bus::spi(0), 0x11);
        hw.set_reply(Bus::i2c(0), 0x22);
        for t in 1..6 {
            hw.complete_all();
            sched.tick(&mut hw, t);
        }

        assert_eq!(sched.phase(a), Some(Phase::Finished(Outcome::Done)));
        assert_eq!(sched.phase(b), Some(Phase::Finished(Outcome::Done)));
        assert_eq!(sched.take_result(a).unwrap().unwrap().as_bytes(), &[0x11]);
        assert_eq!(sched.take_result(b).unwrap().unwrap().as_bytes(), &[0x22]);
        assert_eq!(sched.registry().persistent(spi).map(|s| s.spi.completed), Some(1));
        assert_eq!(
            hw.count(|op| matches!(op, Op::I2cSend { address: 0x48, .. })),
            1
        );
    }

    #[test]
    fn init_picks_the_matching_state() {
        let sensor = Sensor::from(thermometer());
        let mut state = SensorState::default();
        sensor.init(&mut state).unwrap();
        assert!(matches!(state, SensorState::I2c(_)));
        assert_eq!(state.resume_point(), 0);
    }

    #[test]
    fn mismatched_state_is_corrupt() {
        let sensor = Sensor::from(thermometer());
        let mut state = SensorState::Spi(SpiSensorState::default());
        let mut hw = SimPeripherals::new();
        let mut waits = WaitSet::new();
        let mut reply = [0u8; 4];
        let r = sensor.resume(
            &mut state,
            &mut SensorStats::default(),
            &mut CommandReader::new(&[0x01]),
            &mut ReplyWriter::new(&mut reply),
            &mut waits,
            &mut hw,
        );
        assert_eq!(r, Err(HandlerError::CorruptResumePoint(0)));
        assert_eq!(hw.issued(), 0);
    }
}
