// Transaction handlers. Each plugin value is its own immutable config;
// all state it needs across suspensions lives in its State type.

pub mod i2c_sensor;
pub mod sensor;
pub mod spi_sensor;

pub use i2c_sensor::{I2cSensor, I2cSensorState, I2cStep};
pub use sensor::{Sensor, SensorState, SensorStats};
pub use spi_sensor::{SpiSensor, SpiSensorState, SpiSensorStats, SpiStep};
