//! Wall clock and local calendar
//!
//! Every time-dependent decision goes through [`Clock`] so ticks and replies
//! can be replayed at a fixed instant in tests.

use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Resolves "now" into local time-of-day and weekday in a fixed timezone.
#[derive(Clone)]
pub struct Calendar {
    clock: Arc<dyn Clock>,
    tz: Tz,
}

impl Calendar {
    pub fn new(clock: Arc<dyn Clock>, tz: Tz) -> Self {
        Self { clock, tz }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn local_now(&self) -> DateTime<Tz> {
        self.clock.now().with_timezone(&self.tz)
    }

    /// Local "HH:MM"
    pub fn now_time_of_day(&self) -> String {
        self.local_now().format("%H:%M").to_string()
    }

    /// Local weekday, 0 = Sunday
    pub fn now_day_of_week(&self) -> u8 {
        self.local_now().weekday().num_days_from_sunday() as u8
    }
}

#[cfg(test)]
pub use fixed::FixedClock;
