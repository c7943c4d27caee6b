//! Quota values for bandwidth limiters.
//!
//! A [`Quota`] is a normalized `(rate, burst)` pair:
//! - `rate` is expressed in **bytes per second**; [`UNLIMITED`] disables limiting.
//! - `burst` is the bucket capacity in bytes, i.e. the largest single request a limiter
//!   can ever admit.
//!
//! Construction never fails. Quotas usually come from plain numeric configuration, so
//! out-of-range inputs are normalized instead of rejected:
//!
//! ```
//! use tokio_bwlimit::Quota;
//!
//! assert_eq!(Quota::new(0.0, Some(20)), Quota::unlimited());
//! assert_eq!(Quota::new(20.0, None).burst(), 20);
//! assert_eq!(Quota::new(20.0, Some(19)).burst(), 19);
//! ```
use std::fmt;

use crate::limiter::RateLimiter;

/// Rate sentinel meaning "no limit".
pub const UNLIMITED: f64 = f64::INFINITY;

/// Traffic direction on a connection. Each direction has its own quotas and limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Inbound bytes, gated on `poll_read`.
    Read,
    /// Outbound bytes, gated on `poll_write`.
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// A validated `(rate, burst)` pair.
///
/// Equality is exact on both fields: two quotas with the same rate but different
/// bursts are different quotas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    pub(crate) rate: f64,
    pub(crate) burst: usize,
}

impl Quota {
    /// Creates a quota for `rate` bytes per second with an optional `burst`.
    ///
    /// - `rate <= 0`, NaN or [`UNLIMITED`] yields [`Quota::unlimited`].
    /// - A missing or zero `burst` defaults to the rate, rounded up to a whole byte.
    pub fn new(rate: f64, burst: Option<usize>) -> Self {
        if rate.is_nan() || rate <= 0.0 || rate == UNLIMITED {
            return Self::unlimited();
        }

        let burst = match burst {
            Some(burst) if burst > 0 => burst,
            // a limiter with a finite rate and no capacity would never admit anything
            _ => rate.ceil() as usize,
        };

        Self { rate, burst }
    }

    /// The quota that never limits.
    pub const fn unlimited() -> Self {
        Self {
            rate: UNLIMITED,
            burst: 0,
        }
    }

    /// Rate in bytes per second, [`UNLIMITED`] when not limited.
    #[inline]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Bucket capacity in bytes. `0` for the unlimited quota.
    #[inline]
    pub fn burst(&self) -> usize {
        self.burst
    }

    #[inline]
    pub fn is_unlimited(&self) -> bool {
        self.rate == UNLIMITED
    }

    /// Builds a fresh limiter configured with this quota.
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(*self)
    }
}

impl Default for Quota {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited")
        } else {
            write!(f, "{} B/s (burst {} B)", self.rate, self.burst)
        }
    }
}
