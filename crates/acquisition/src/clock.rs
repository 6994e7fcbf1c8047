//! Wall-clock abstraction.
//!
//! Daily quota windows and cache expiry are decided on wall-clock time, which
//! must be controllable in tests. Sleeping still goes through `tokio::time`.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::warn;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current UTC calendar date.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// The real system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    fn lock_now(&self) -> MutexGuard<'_, DateTime<Utc>> {
        self.now.lock().unwrap_or_else(|poisoned| {
            warn!("Manual clock mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.lock_now() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock_now();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock_now()
    }
}
