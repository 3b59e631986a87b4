use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("requested {requested} bytes exceeds limiter burst {burst}")]
    ExceedsBurst { requested: u64, burst: u64 },
    #[error("wait canceled")]
    Canceled,
}

struct Bucket {
    available: f64,
    last_refill: Instant,
}

/// Token bucket over bytes: `rate` bytes per second refill, up to `burst`
/// accumulated. `wait_n` suspends until the requested tokens are available
/// or the token is cancelled.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate: u64, burst: u64) -> Self {
        RateLimiter {
            rate: rate as f64,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                available: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes `n` tokens, sleeping until the bucket can cover them. The debt
    /// is booked immediately so concurrent waiters queue behind each other.
    pub async fn wait_n(&self, n: u64, cancel: &CancellationToken) -> Result<(), WaitError> {
        if n as f64 > self.burst {
            return Err(WaitError::ExceedsBurst {
                requested: n,
                burst: self.burst as u64,
            });
        }

        let delay = {
            let mut bucket = self.bucket.lock().expect("limiter lock poisoned");
            let now = Instant::now();
            let refilled = bucket.available
                + now.duration_since(bucket.last_refill).as_secs_f64() * self.rate;
            bucket.available = refilled.min(self.burst) - n as f64;
            bucket.last_refill = now;
            if bucket.available >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-bucket.available / self.rate)
            }
        };

        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(WaitError::Canceled),
        }
    }
}
