//! Spin-then-yield backoff for short waits on in-flight slot operations

use needlework_core::SPIN_LIMIT;
use std::hint::spin_loop;
use std::thread;

/// Exponential spin with a yield fallback
///
/// Used only where the awaited party is already mid-operation (a slot held
/// busy by another thread, a queue ticket reserved but not yet written), so
/// the wait is always short. Anything that can wait on user code parks on a
/// condvar instead.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            for _ in 0..(1u32 << self.step.min(6)) {
                spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }
}
