//! Wall-clock abstraction.
//!
//! Templates bind the reserved `[timestamp]` placeholder and the document
//! store stamps `created_at` / `updated_at` from a [`ClockSource`], so tests
//! can pin time with [`FixedClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Abstraction over the system clock for dependency injection.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now_millis(&self) -> u64;

    /// Current time in whole seconds since Unix epoch.
    fn now_secs(&self) -> u64 {
        self.now_millis() / 1000
    }

    /// Current time as a UTC date-time.
    fn now_utc(&self) -> DateTime<Utc> {
        // Millis since epoch fit comfortably in i64.
        #[allow(clippy::cast_possible_wrap)]
        let millis = self.now_millis() as i64;
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually advanced clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct FixedClock {
    millis: AtomicU64,
}

impl FixedClock {
    #[must_use]
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_millis: u64) {
        self.millis.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

impl ClockSource for FixedClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
