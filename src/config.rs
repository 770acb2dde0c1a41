// Compile-time limits and protocol constants.
// Everything is sized up front; nothing here is mutated at runtime.

/// Configured plugins per scheduler registry.
pub const MAX_PLUGINS: usize = 4;

/// Instance slots per scheduler.
pub const MAX_INSTANCES: usize = 8;

/// Conditions one instance may wait on at the same time.
pub const MAX_WAITS: usize = 4;

/// Bytes of command input a slot can hold.
pub const COMMAND_CAP: usize = 16;

/// Bytes of reply output a slot can hold.
pub const REPLY_CAP: usize = 16;

/// SPI buses addressable by bus id (ids 0..MAX_SPI_BUSES).
pub const MAX_SPI_BUSES: usize = 4;

/// I2C buses addressable by bus id.
pub const MAX_I2C_BUSES: usize = 2;

/// Base timer tick interval (ms). The uptime clock counts in these.
pub const BASE_TICK_MS: u32 = 10;

// Sensor exchange used by the SPI sensor plugin
pub mod sensor {
    pub const OPCODE: u16 = 0x0003;
    pub const OPCODE_BITS: u8 = 0x08;
    // payload byte count for the adapter (low nibble)
    pub const SEND_FLAGS: u8 = 0x02;
    pub const READ_ADDRESS: u16 = 0x0000;
    pub const READ_ADDRESS_BITS: u8 = 0x08;
    // give the sensor time to process before reading back
    pub const SETTLE_MS: u32 = 1000;
}
