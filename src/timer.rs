//! Timer records and their opaque handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

static NUM_CREATED: AtomicU64 = AtomicU64::new(0);

pub(crate) struct Timer {
    callback: Mutex<TimerCallback>,
    expiration: Mutex<Instant>,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    pub fn new(callback: TimerCallback, when: Instant, interval: Option<Duration>) -> Timer {
        Timer {
            callback: Mutex::new(callback),
            expiration: Mutex::new(when),
            interval,
            sequence: NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub fn run(&self) {
        (self.callback.lock())();
    }

    pub fn expiration(&self) -> Instant {
        *self.expiration.lock()
    }

    pub fn repeat(&self) -> bool {
        self.interval.is_some()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Push a repeater's expiration one interval past `now`.
    pub fn restart(&self, now: Instant) {
        if let Some(interval) = self.interval {
            *self.expiration.lock() = now + interval;
        }
    }
}

/// Identifies a scheduled timer for cancellation.
///
/// The allocation address alone is not enough: a canceled slot can be
/// reused by a later timer, so the sequence number disambiguates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerId {
    pub(crate) addr: usize,
    pub(crate) sequence: u64,
}

impl TimerId {
    pub(crate) fn of(timer: &std::sync::Arc<Timer>) -> TimerId {
        TimerId {
            addr: std::sync::Arc::as_ptr(timer) as usize,
            sequence: timer.sequence(),
        }
    }
}
