//! Wall clock injection.
//!
//! Serial allocation and renewal selection read "now" through a [`Clock`] instead of calling
//! [`OffsetDateTime::now_utc`] directly so both stay deterministic under test.

use std::sync::{Arc, Mutex};
use time::{Date, Duration, OffsetDateTime};

pub type DynClock = Arc<dyn Clock + Send + Sync>;

pub trait Clock {
    fn now(&self) -> OffsetDateTime;

    /// The current UTC calendar date.
    fn today(&self) -> Date {
        self.now().date()
    }
}

/// The system clock, in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<OffsetDateTime>,
}

impl FixedClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
