// Resumable peripheral transactions for a cooperative, single-threaded
// scheduler. No per-task stacks, no blocking calls, no heap.
//
// kernel:  continuations, wait sets, scheduler, bus leases, wake flags
// drivers: peripheral engine trait, embedded-hal adapter, simulator, clock
// plugins: concrete transaction handlers (SPI sensor, I2C sensor)
// codec:   encoded-uint command/reply streams

#![cfg_attr(not(test), no_std)]

pub mod codec;
pub mod config;
pub mod drivers;
pub mod kernel;
pub mod plugins;
