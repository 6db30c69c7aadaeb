//! Daily activity counters and heartbeat gating.

use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;
use tracing::info;

/// Counters for the current calendar day.
///
/// `rate_limit_count` is additionally reset whenever the capability is
/// restarted, since it measures how hard the current session is being
/// pushed back on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub tickets_spotted: u64,
    pub error_count: u64,
    pub rate_limit_count: u64,
    day: NaiveDate,
    active_since_heartbeat: bool,
}

impl CycleStats {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            tickets_spotted: 0,
            error_count: 0,
            rate_limit_count: 0,
            day: today,
            active_since_heartbeat: false,
        }
    }

    pub fn day(&self) -> NaiveDate {
        self.day
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
        self.active_since_heartbeat = true;
    }

    pub fn record_rate_limit(&mut self) {
        self.rate_limit_count += 1;
    }

    pub fn record_tickets(&mut self, count: usize) {
        self.tickets_spotted += count as u64;
        self.active_since_heartbeat = true;
    }

    pub fn reset_rate_limits(&mut self) {
        self.rate_limit_count = 0;
    }

    /// Zero every counter if `today` is a different day. Returns whether a
    /// rollover happened.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if today == self.day {
            return false;
        }
        info!(
            previous = %self.day,
            tickets = self.tickets_spotted,
            errors = self.error_count,
            "new day - resetting stats"
        );
        self.tickets_spotted = 0;
        self.error_count = 0;
        self.rate_limit_count = 0;
        self.day = today;
        true
    }

    /// Whether tickets or errors were recorded since the last call.
    pub fn take_activity(&mut self) -> bool {
        std::mem::take(&mut self.active_since_heartbeat)
    }
}

/// Fires once per `interval`.
#[derive(Debug, Clone)]
pub struct HeartbeatClock {
    interval: Duration,
    last: DateTime<Utc>,
}

impl HeartbeatClock {
    pub fn new(interval: Duration, started: DateTime<Utc>) -> Self {
        Self {
            interval,
            last: started,
        }
    }

    /// True when the interval has elapsed since the last firing; firing
    /// restarts the interval.
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        let elapsed = (now - self.last).to_std().unwrap_or(Duration::ZERO);
        if elapsed < self.interval {
            return false;
        }
        self.last = now;
        true
    }
}
