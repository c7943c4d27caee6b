//! Token-bucket rate limiter with live reconfiguration and cancellable waits.
//!
//! [`RateLimiter`] admits `n` tokens (bytes) against a refill rate and a bucket capacity
//! taken from a [`Quota`]:
//! - The bucket starts full, so the first `burst` bytes are admitted immediately.
//! - [`RateLimiter::acquire`] *reserves* tokens up front. The token count may go negative;
//!   the caller then sleeps until the debt is repaid by refill. Concurrent callers queue up
//!   behind each other's reservations, which keeps the aggregate rate exact.
//! - Requests larger than the burst fail immediately with
//!   [`LimitError::CapacityExceeded`]; they could never be satisfied.
//! - If the cancellation token fires while waiting, the reservation is handed back (minus
//!   whatever later reservations already rely on) and [`LimitError::Cancelled`] is returned.
//!   Dropping the `acquire` future mid-wait hands it back the same way.
//!
//! ```
//! use tokio_bwlimit::{Quota, RateLimiter};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(Quota::new(1024.0, None)); // 1 KiB/s
//! let cancel = CancellationToken::new();
//!
//! limiter.acquire(512, &cancel).await.unwrap(); // served from the initial burst
//! assert!(limiter.acquire(4096, &cancel).await.is_err()); // larger than the bucket
//! # }
//! ```
//!
//! ## Under the hood
//! - Time is read from [`tokio::time::Instant`], so a paused Tokio clock drives the limiter
//!   deterministically in tests.
//! - State lives behind a short `parking_lot::Mutex` that is never held across an `.await`.
use std::{fmt, time::Duration};

use parking_lot::Mutex;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::{error::LimitError, quota::Quota};

/// Used instead of `Instant + Duration` overflow for absurdly long waits (~30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

struct Bucket {
    quota: Quota,
    tokens: f64,
    /// When `tokens` was last brought up to date.
    last: Instant,
    /// When the most recent reservation matures.
    last_event: Instant,
}

impl Bucket {
    /// Token count at `now`, capped at the burst.
    fn advance(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last);
        let tokens = self.tokens + tokens_from_duration(self.quota.rate, elapsed);
        tokens.min(self.quota.burst as f64)
    }
}

struct Reservation {
    tokens: usize,
    time_to_act: Instant,
    rate: f64,
}

/// Hands the reservation back unless the wait ran to completion, so a cancelled token
/// and a dropped `acquire` future release shared budget alike.
struct PendingReservation<'a> {
    limiter: &'a RateLimiter,
    reservation: Option<Reservation>,
}

impl Drop for PendingReservation<'_> {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            self.limiter.cancel(&reservation);
        }
    }
}

/// A thread-safe token bucket measured in bytes.
///
/// Shareable by reference (or behind an `Arc`) between any number of concurrent
/// [`acquire`](Self::acquire) callers; [`set_quota`](Self::set_quota) reconfigures it in
/// place without disturbing waiters' existing reservations.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter with a full bucket.
    pub fn new(quota: Quota) -> Self {
        let now = Instant::now();
        Self {
            bucket: Mutex::new(Bucket {
                quota,
                tokens: quota.burst as f64,
                last: now,
                last_event: now,
            }),
        }
    }

    /// Current rate and burst.
    pub fn quota(&self) -> Quota {
        self.bucket.lock().quota
    }

    /// Replaces rate and burst in place.
    ///
    /// Tokens accumulated so far are kept; a smaller burst caps them on the next refill.
    /// Leaving the unlimited state starts from a full bucket.
    pub fn set_quota(&self, quota: Quota) {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();

        bucket.tokens = if bucket.quota.is_unlimited() {
            quota.burst as f64
        } else {
            bucket.advance(now)
        };
        bucket.last = now;
        bucket.quota = quota;
    }

    /// Waits until `n` tokens are available and consumes them.
    ///
    /// Fails with [`LimitError::Cancelled`] if `cancel` fires first (or already fired),
    /// and with [`LimitError::CapacityExceeded`] without waiting if `n` exceeds the burst.
    pub async fn acquire(&self, n: usize, cancel: &CancellationToken) -> Result<(), LimitError> {
        if cancel.is_cancelled() {
            return Err(LimitError::Cancelled);
        }

        if n == 0 {
            return Ok(());
        }

        let reservation = self.reserve(n)?;
        if reservation.time_to_act <= Instant::now() {
            return Ok(());
        }

        let time_to_act = reservation.time_to_act;
        let mut pending = PendingReservation {
            limiter: self,
            reservation: Some(reservation),
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(LimitError::Cancelled),
            _ = sleep_until(time_to_act) => {
                pending.reservation = None;
                Ok(())
            }
        }
    }

    fn reserve(&self, n: usize) -> Result<Reservation, LimitError> {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();

        if bucket.quota.is_unlimited() {
            return Ok(Reservation {
                tokens: 0,
                time_to_act: now,
                rate: bucket.quota.rate,
            });
        }

        if n > bucket.quota.burst {
            return Err(LimitError::CapacityExceeded {
                requested: n,
                burst: bucket.quota.burst,
            });
        }

        let tokens = bucket.advance(now) - n as f64;
        let wait = duration_from_tokens(bucket.quota.rate, -tokens);
        let time_to_act = now.checked_add(wait).unwrap_or(now + FAR_FUTURE);

        bucket.last = now;
        bucket.tokens = tokens;
        bucket.last_event = time_to_act;

        Ok(Reservation {
            tokens: n,
            time_to_act,
            rate: bucket.quota.rate,
        })
    }

    /// Hands an unused reservation back to the bucket.
    fn cancel(&self, reservation: &Reservation) {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();

        if bucket.quota.is_unlimited() || reservation.tokens == 0 || reservation.time_to_act <= now
        {
            return;
        }

        // tokens that later reservations already counted on stay consumed
        let promised = tokens_from_duration(
            reservation.rate,
            bucket
                .last_event
                .saturating_duration_since(reservation.time_to_act),
        );
        let restore = reservation.tokens as f64 - promised;
        if restore <= 0.0 {
            return;
        }

        let tokens = (bucket.advance(now) + restore).min(bucket.quota.burst as f64);
        bucket.last = now;
        bucket.tokens = tokens;

        if reservation.time_to_act == bucket.last_event {
            let previous = reservation.time_to_act.checked_sub(duration_from_tokens(
                reservation.rate,
                reservation.tokens as f64,
            ));
            if let Some(previous) = previous
                && previous >= now
            {
                bucket.last_event = previous;
            }
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bucket = self.bucket.lock();
        f.debug_struct("RateLimiter")
            .field("quota", &bucket.quota)
            .field("tokens", &bucket.tokens)
            .finish()
    }
}

fn tokens_from_duration(rate: f64, duration: Duration) -> f64 {
    if rate <= 0.0 || !rate.is_finite() {
        return 0.0;
    }
    duration.as_secs_f64() * rate
}

fn duration_from_tokens(rate: f64, tokens: f64) -> Duration {
    if tokens <= 0.0 || rate <= 0.0 || !rate.is_finite() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(tokens / rate).unwrap_or(FAR_FUTURE)
}
