// Peripheral engines and time sources, board-independent.
//
// peripherals: the engine interface handlers consume (start + poll)
// hal:         engine over embedded-hal SpiDevice / I2c
// sim:         scripted engine for tests and host demos
// clock:       millisecond clocks for timeout waits

pub mod clock;
pub mod hal;
pub mod peripherals;
pub mod sim;

pub use clock::{Clock, ManualClock, UptimeClock};
pub use peripherals::{Bus, BusError, BusId, BusKind, Peripherals};
