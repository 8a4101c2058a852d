//! Process-wide upstream rate-limit gate.
//!
//! The upstream limiter is keyed on the API credential, not on a resource, so a
//! single gate is shared by every resource engine. Once tripped by a 429, the
//! gate answers `Blocked` until the cooldown elapses and no request reaches the
//! upstream in the meantime.

pub mod retry_after;

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

pub use retry_after::parse_retry_after;

/// Answer from [`RateLimitGate::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Upstream calls may proceed.
    Allowed,
    /// Upstream is cooling down. `retry_after_secs` is rounded up, never 0.
    Blocked { retry_after_secs: u64 },
}

/// Tracks a single "blocked until" instant for the whole process.
#[derive(Debug, Default)]
pub struct RateLimitGate {
    blocked_until: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report whether upstream calls are allowed at `now`.
    pub fn check(&self, now: Instant) -> GateDecision {
        let blocked_until = *self.lock();
        match blocked_until {
            Some(until) if now < until => GateDecision::Blocked {
                retry_after_secs: ceil_secs(until - now),
            },
            _ => GateDecision::Allowed,
        }
    }

    /// Apply an upstream `Retry-After` value, using the system clock for
    /// HTTP-date values. Returns `true` if the cooldown was extended.
    pub fn trip(&self, retry_after: &str, now: Instant) -> bool {
        self.trip_with_clock(retry_after, now, Utc::now())
    }

    /// Same as [`trip`](Self::trip) with an explicit wall clock for date values.
    ///
    /// An unparseable value is dropped: the gate keeps whatever state it had.
    pub fn trip_with_clock(&self, retry_after: &str, now: Instant, wall_now: DateTime<Utc>) -> bool {
        match parse_retry_after(retry_after, wall_now) {
            Some(delay) => self.extend(delay, now),
            None => {
                warn!(
                    retry_after = retry_after,
                    "Ignoring malformed Retry-After from upstream; no cooldown applied"
                );
                false
            }
        }
    }

    /// Block upstream calls until `now + delay`, unless already blocked longer.
    ///
    /// A zero delay is a no-op. Returns `true` if the cooldown was extended.
    pub fn extend(&self, delay: Duration, now: Instant) -> bool {
        if delay.is_zero() {
            return false;
        }
        let Some(candidate) = now.checked_add(delay) else {
            warn!(
                delay_secs = delay.as_secs(),
                "Retry-After delay overflows the clock; no cooldown applied"
            );
            return false;
        };

        let mut blocked_until = self.lock();
        if matches!(*blocked_until, Some(current) if current >= candidate) {
            return false;
        }
        *blocked_until = Some(candidate);
        info!(
            cooldown_secs = ceil_secs(delay),
            "Upstream rate limit tripped; pausing upstream calls"
        );
        true
    }

    /// The current cooldown deadline, if one was ever set.
    pub fn blocked_until(&self) -> Option<Instant> {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.blocked_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whole seconds, rounded up.
fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
