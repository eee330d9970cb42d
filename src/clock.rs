//! Monotonic precision clock for the virtual buffer-switch cadence.
//!
//! `wait_until` trades CPU for accuracy the same way the transmit pacing
//! loop does: sleep while plenty of time remains, spin for the last stretch.

use std::time::{Duration, Instant};

/// Remaining time above which the wait yields the CPU instead of spinning.
const SLEEP_THRESHOLD: Duration = Duration::from_millis(2);

/// Monotonic time source with a hybrid sleep/spin wait.
pub struct PrecisionClock;

impl PrecisionClock {
    #[inline]
    pub fn now() -> Instant {
        Instant::now()
    }

    /// Block until `target`. Never returns early; may return late by at
    /// most the scheduler quantum.
    ///
    /// While more than 2 ms remain the thread sleeps in 1 ms slices so
    /// other cores make progress; below that it spins with a pause hint
    /// to hit sub-millisecond targets without timer jitter.
    pub fn wait_until(target: Instant) {
        let mut now = Instant::now();
        while now < target {
            let remaining = target - now;
            if remaining > SLEEP_THRESHOLD {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                std::hint::spin_loop();
            }
            now = Instant::now();
        }
    }
}
