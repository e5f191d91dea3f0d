//! Programmable Interval Timer (8253/8254)
//!
//! Channel 0 drives the scheduler tick at 100 Hz (10 ms per tick).

use x86_64::instructions::port::Port;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// PIT input clock in Hz
const PIT_BASE_HZ: u32 = 1_193_182;

/// Scheduler tick rate
pub const TICK_HZ: u32 = 100;

/// Program channel 0 for rate generation at TICK_HZ.
pub fn init() {
    let divisor = (PIT_BASE_HZ / TICK_HZ) as u16;

    let mut command = Port::<u8>::new(PIT_COMMAND);
    let mut channel0 = Port::<u8>::new(PIT_CHANNEL0);
    unsafe {
        // Channel 0, lobyte/hibyte access, mode 3 (square wave)
        command.write(0x36);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }

    crate::log!("[PIT] 100 Hz tick programmed (divisor {})", divisor);
}
