//! Instantaneous rate limiting for stored data.
//!
//! The rate is computed from the gap to the previously accepted reading only,
//! so a burst after a long pause passes while back-to-back readings are thinned.

use chrono::{DateTime, Utc};

/// Decide whether a reading at `now` may be stored.
///
/// Accepts iff `1 / (now - last_accepted)` is at most `max_per_second`. An unset
/// baseline always accepts.
pub fn accepts(now: DateTime<Utc>, last_accepted: Option<DateTime<Utc>>, max_per_second: f64) -> bool {
    let Some(last) = last_accepted else {
        return true;
    };

    let elapsed_secs = (now - last).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0;

    // Zero elapsed gives an infinite rate, which only an infinite limit admits.
    let rate = 1.0 / elapsed_secs;
    rate <= max_per_second
}

/// Stateful limiter that remembers the last accepted reading.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_per_second: f64,
    last_accepted: Option<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(max_per_second: f64) -> Self {
        Self {
            max_per_second,
            last_accepted: None,
        }
    }

    /// Accept or reject a reading at `now`, recording it as the new baseline when accepted.
    pub fn try_accept(&mut self, now: DateTime<Utc>) -> bool {
        if accepts(now, self.last_accepted, self.max_per_second) {
            self.last_accepted = Some(now);
            true
        } else {
            false
        }
    }

    pub fn max_per_second(&self) -> f64 {
        self.max_per_second
    }

    pub fn set_max_per_second(&mut self, max_per_second: f64) {
        self.max_per_second = max_per_second;
    }

    /// Timestamp of the most recently accepted reading.
    pub fn last_accepted(&self) -> Option<DateTime<Utc>> {
        self.last_accepted
    }

    /// Forget the baseline so the next reading is accepted.
    pub fn reset(&mut self) {
        self.last_accepted = None;
    }
}
