use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow};
use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Outcome of one retryable attempt. `Abort` stops retrying immediately and
/// surfaces the error; `Retry` backs off and tries again.
pub enum Attempt<T> {
    Done(T),
    Retry(anyhow::Error),
    Abort(anyhow::Error),
}

/// Runs `f` up to `attempts` times with linearly growing backoff and full
/// jitter: the delay before attempt k is drawn from [0, min(init * k, max)].
/// With the (50ms, 200ms, 40) shape the total worst case stays under ~8s.
pub async fn run<T, F, Fut>(
    cancel: &CancellationToken,
    init: Duration,
    max: Duration,
    attempts: usize,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut last_err = anyhow!("no attempts made");
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(anyhow!("retry canceled"));
        }
        match f().await {
            Attempt::Done(v) => return Ok(v),
            Attempt::Abort(e) => return Err(e),
            Attempt::Retry(e) => last_err = e,
        }
        if attempt == attempts {
            break;
        }
        let cap = (init * attempt as u32).min(max);
        let delay = rand::rng().random_range(Duration::ZERO..=cap);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(anyhow!("retry canceled")),
        }
    }
    Err(last_err)
}
