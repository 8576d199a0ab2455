//! Arrival timestamps that never go backwards

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Hands out wall-clock arrival times, clamped so successive calls never
/// decrease even if the system clock steps back or two threads race
#[derive(Debug, Default)]
pub struct MonotonicClock {
    /// Last issued instant in microseconds since the epoch
    last_micros: AtomicI64,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current arrival time
    pub fn now(&self) -> DateTime<Utc> {
        self.observe(Utc::now())
    }

    /// Clamp `wall` against everything issued so far and record it
    pub fn observe(&self, wall: DateTime<Utc>) -> DateTime<Utc> {
        let wall_micros = wall.timestamp_micros();
        let previous = self.last_micros.fetch_max(wall_micros, Ordering::AcqRel);
        let issued = previous.max(wall_micros);
        DateTime::from_timestamp_micros(issued).unwrap_or(wall)
    }
}
