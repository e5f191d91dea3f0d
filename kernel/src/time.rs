//! Time utilities
//!
//! The PIT runs at 100 Hz, so one tick is 10 ms of uptime.

use core::sync::atomic::{AtomicU64, Ordering};

/// Milliseconds per PIT tick (100 Hz)
pub const MS_PER_TICK: u64 = 10;

/// Monotonic tick counter, incremented by the timer interrupt
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Get the monotonic tick count
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Get current uptime in milliseconds
pub fn uptime_ms() -> u64 {
    ticks() * MS_PER_TICK
}

/// Get current uptime in seconds
pub fn uptime_secs() -> u64 {
    uptime_ms() / 1000
}

/// Advance the tick counter (called by the timer interrupt)
pub fn tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Convert a millisecond duration to ticks, rounding up
pub fn ms_to_ticks(ms: u64) -> u64 {
    ms.div_ceil(MS_PER_TICK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_to_ticks_rounds_up() {
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(11), 2);
        assert_eq!(ms_to_ticks(25), 3);
    }
}
