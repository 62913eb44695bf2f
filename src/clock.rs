//! Time source abstraction. `Clock` is an explicit constructor
//! dependency: the worker and the prepared `SELECT`s take one instead of
//! reaching for `Utc::now()` directly, so tests can pin "now" when
//! exercising expiry.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// A tick is a signed 64-bit instant in a single fixed epoch/zone; every
/// reader and writer must agree on it. We use UTC milliseconds since the
/// Unix epoch.
pub trait Clock: Send + Sync {
    fn now_tick(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_tick(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock a test can move forward or pin, for exercising expiry without
/// sleeping real time.
#[derive(Debug)]
pub struct FakeClock {
    tick: AtomicI64,
}

impl FakeClock {
    pub fn new(start_tick: i64) -> Self {
        Self {
            tick: AtomicI64::new(start_tick),
        }
    }

    pub fn set(&self, tick: i64) {
        self.tick.store(tick, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_millis: i64) {
        self.tick.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_tick(&self) -> i64 {
        self.tick.load(Ordering::SeqCst)
    }
}
