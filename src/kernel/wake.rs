// Wake flag signaling between completion ISRs and the main loop
//
// ISRs (bus engine, periodic timer) set flags; the main loop consumes
// them via try_wake() and only then asks the scheduler to re-check its
// waiting instances. Bus completions are a bitmask so two buses
// finishing together cannot swallow each other. Critical section
// guards targets without atomic RMW (riscv32imc).
// Uptime is tracked in BASE_TICK_MS ticks, one per timer interrupt.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::drivers::peripherals::{Bus, BusKind};

static WAKE_TIMER: AtomicBool = AtomicBool::new(false);

// bit n: spi bus n (0..16), bit 16 + n: i2c bus n
static WAKE_BUSES: critical_section::Mutex<Cell<u32>> =
    critical_section::Mutex::new(Cell::new(0));

static UPTIME_TICKS: critical_section::Mutex<Cell<u32>> =
    critical_section::Mutex::new(Cell::new(0));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeFlags {
    pub buses: u32,
    pub timer: bool,
}

impl WakeFlags {
    #[inline]
    pub fn bus(&self, bus: Bus) -> bool {
        self.buses & bus_bit(bus) != 0
    }
}

#[inline]
const fn bus_bit(bus: Bus) -> u32 {
    let shift = match bus.kind {
        BusKind::Spi => 0,
        BusKind::I2c => 16,
    };
    1 << (shift + (bus.id.0 as u32 & 0x0F))
}

fn take_wake_flags() -> Option<WakeFlags> {
    critical_section::with(|cs| {
        let buses = WAKE_BUSES.borrow(cs).replace(0);
        let timer = WAKE_TIMER.swap(false, Ordering::Relaxed);

        if buses == 0 && !timer {
            return None;
        }
        Some(WakeFlags { buses, timer })
    })
}

/// Called by a bus engine when an operation on `bus` finishes.
#[inline]
pub fn signal_bus(bus: Bus) {
    critical_section::with(|cs| {
        let flags = WAKE_BUSES.borrow(cs);
        flags.set(flags.get() | bus_bit(bus));
    });
}

#[inline]
pub fn signal_timer() {
    WAKE_TIMER.store(true, Ordering::Release);
    critical_section::with(|cs| {
        let ticks = UPTIME_TICKS.borrow(cs);
        ticks.set(ticks.get().wrapping_add(1));
    });
}

pub fn uptime_ticks() -> u32 {
    critical_section::with(|cs| UPTIME_TICKS.borrow(cs).get())
}

#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "riscv32")]
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack));
    }

    #[cfg(not(target_arch = "riscv32"))]
    core::hint::spin_loop();
}

pub fn try_wake() -> Option<WakeFlags> {
    take_wake_flags()
}
