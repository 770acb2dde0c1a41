// spi-coop host demo
//
// Runs sensor transactions through the scheduler against a fake sensor
// wired to one embedded-hal SPI device and one I2C bus. Every request
// word from the command line (decimal or 0x-hex, default 0x1234) goes to
// both sensors.
//
// A host thread stands in for the periodic timer interrupt. Main loop:
// service queued transfers -> drain wake flags -> tick when a deadline
// is due or an awaited bus finished, otherwise idle until the next
// interrupt.

use std::convert::Infallible;
use std::process::ExitCode;
use std::time::Duration;

use embedded_hal::i2c::{self, I2c, SevenBitAddress};
use embedded_hal::spi::{self, Operation, SpiDevice};
use flexi_logger::Logger;
use log::{debug, error, info};
use static_cell::StaticCell;

use spi_coop::codec::{CommandReader, encode_u16};
use spi_coop::config::BASE_TICK_MS;
use spi_coop::drivers::clock::UptimeClock;
use spi_coop::drivers::hal::HalPeripherals;
use spi_coop::drivers::{BusId, Clock};
use spi_coop::kernel::wake;
use spi_coop::kernel::{InstanceId, Scheduler, SchedulerConfig, WaitPolicy};
use spi_coop::plugins::{I2cSensor, Sensor, SpiSensor};

const DEFAULT_REQUEST: u16 = 0x1234;
const SENSOR_REPLY: u16 = 0x0055;
// fail anything stuck at one step for longer than this
const STEP_DEADLINE_MS: u32 = 5_000;

const MAX_REQUESTS: usize = 4;
const THERMOMETER_ADDRESS: u8 = 0x48;

static SCHEDULER: StaticCell<Scheduler<Sensor>> = StaticCell::new();

/// Sensor that answers every read with a fixed word, over SPI or I2C.
#[derive(Default)]
struct FakeSensor {
    last_command: [u8; 4],
}

impl spi::ErrorType for FakeSensor {
    type Error = Infallible;
}

impl SpiDevice for FakeSensor {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Infallible> {
        for op in operations.iter_mut() {
            match op {
                Operation::Write(bytes) => {
                    let n = bytes.len().min(self.last_command.len());
                    self.last_command[..n].copy_from_slice(&bytes[..n]);
                    debug!("sensor: rx {:02x?}", &self.last_command[..n]);
                }
                Operation::Read(buf) => {
                    for (dst, src) in buf.iter_mut().zip(SENSOR_REPLY.to_be_bytes()) {
                        *dst = src;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl i2c::ErrorType for FakeSensor {
    type Error = Infallible;
}

impl I2c<SevenBitAddress> for FakeSensor {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [i2c::Operation<'_>],
    ) -> Result<(), Infallible> {
        for op in operations.iter_mut() {
            match op {
                i2c::Operation::Write(bytes) => {
                    let n = bytes.len().min(self.last_command.len());
                    self.last_command[..n].copy_from_slice(&bytes[..n]);
                    debug!("sensor@{:#04x}: rx {:02x?}", address, &self.last_command[..n]);
                }
                i2c::Operation::Read(buf) => {
                    for (dst, src) in buf.iter_mut().zip(SENSOR_REPLY.to_be_bytes()) {
                        *dst = src;
                    }
                }
            }
        }
        Ok(())
    }
}

fn spawn_tick_timer() {
    std::thread::spawn(|| {
        loop {
            std::thread::sleep(Duration::from_millis(BASE_TICK_MS as u64));
            wake::signal_timer();
        }
    });
}

fn parse_request(arg: &str) -> Option<u16> {
    match arg.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => arg.parse().ok(),
    }
}

fn main() -> ExitCode {
    let _logger = match Logger::try_with_env_or_str("info").and_then(|l| l.start()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("logger init failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut requests = [0u16; MAX_REQUESTS];
    let mut n = 0;
    for arg in std::env::args().skip(1) {
        let Some(word) = parse_request(&arg) else {
            error!("not a 16-bit value: {}", arg);
            return ExitCode::FAILURE;
        };
        if n == requests.len() {
            error!("at most {} requests", requests.len());
            return ExitCode::FAILURE;
        }
        requests[n] = word;
        n += 1;
    }
    if n == 0 {
        requests[0] = DEFAULT_REQUEST;
        n = 1;
    }

    let clock = UptimeClock;
    spawn_tick_timer();

    let mut hw = HalPeripherals::new([FakeSensor::default()], [FakeSensor::default()]);
    let sched = SCHEDULER.init(Scheduler::new(SchedulerConfig {
        wait_policy: WaitPolicy::StepDeadline {
            ms: STEP_DEADLINE_MS,
        },
    }));

    let sensors = [
        Sensor::from(SpiSensor::new(BusId(0))),
        Sensor::from(I2cSensor {
            bus: BusId(0),
            address: THERMOMETER_ADDRESS,
            command_register: 0x01,
            result_register: 0x00,
        }),
    ];
    let mut plugins = [None; 2];
    for (slot, sensor) in plugins.iter_mut().zip(sensors) {
        match sched.register(sensor) {
            Ok(id) => *slot = Some(id),
            Err(e) => {
                error!("register: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    let mut ids = [None::<InstanceId>; 2 * MAX_REQUESTS];
    let mut slots = ids.iter_mut();
    let mut pending = 0;
    for &word in &requests[..n] {
        let mut cmd = [0u8; 3];
        let len = encode_u16(word, &mut cmd);
        for plugin in plugins.iter().flatten() {
            match sched.submit(*plugin, &cmd[..len]) {
                Ok(id) => {
                    info!("{}: request {:#06x} ({:02x?})", id, word, &cmd[..len]);
                    if let Some(slot) = slots.next() {
                        *slot = Some(id);
                        pending += 1;
                    }
                }
                Err(e) => {
                    error!("submit {:#06x}: {}", word, e);
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    let mut failed = false;
    while pending > 0 {
        hw.service();
        let flags = wake::try_wake();
        let now = clock.now_ms();
        if !sched.needs_tick(now, flags) {
            wake::wait_for_interrupt();
            // the host has no wfi; don't spin a core between timer ticks
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        let report = sched.tick(&mut hw, now);
        debug!("tick @{}ms: {:?}", now, report);

        for slot in ids.iter_mut() {
            let Some(id) = *slot else { continue };
            match sched.take_result(id) {
                Some(Ok(reply)) => {
                    let value = CommandReader::new(reply.as_bytes()).read_encoded_u16();
                    match value {
                        Ok(v) => info!("{}: response {:#06x}", id, v),
                        Err(e) => error!("{}: bad reply {:?}: {}", id, reply, e),
                    }
                }
                Some(Err(e)) => {
                    error!("{}: {}", id, e);
                    failed = true;
                }
                None => continue,
            }
            *slot = None;
            pending -= 1;
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
