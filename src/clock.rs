//! Time sources.
//!
//! All timestamps in the runtime are `f64` seconds since the Unix epoch. The
//! session injects one [`Clock`] into the cache and every device, so tests can
//! drive staleness and lock expiry with a [`ManualClock`] instead of sleeping.

use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    /// Current time in seconds since the epoch.
    fn now(&self) -> f64;
}

/// Wall clock backed by `chrono`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        let now = chrono::Utc::now();
        now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }

    pub fn set(&self, t: f64) {
        *self.now.lock() = t;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

/// Virtual time line used while simulating.
///
/// Waiting on a simulated movement never sleeps; it advances this clock to the
/// moment the movement would have finished.
#[derive(Debug, Default)]
pub struct SimClock {
    time: Mutex<f64>,
}

impl SimClock {
    pub fn new(start: f64) -> Self {
        Self {
            time: Mutex::new(start),
        }
    }

    pub fn time(&self) -> f64 {
        *self.time.lock()
    }

    /// Advance to `until` unless the clock is already past it.
    pub fn wait_until(&self, until: f64) {
        let mut t = self.time.lock();
        if until > *t {
            *t = until;
        }
    }

    pub fn reset(&self, start: f64) {
        *self.time.lock() = start;
    }
}
