//! Exponential backoff with jitter for adapter calls that hit a rate limit.
//!
//! Mirrors the shape of a `tower::retry::Policy`-style backoff but is driven
//! explicitly by each adapter around a single HTTP call, since adapters also
//! need to respect an overall call deadline the generic `tower` retry layer
//! doesn't know about.

use rand::Rng;
use std::time::Duration;

/// Backoff configuration: base 2s, cap 60s (spec §5's backpressure policy).
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            base: meridian_core::defaults::BACKOFF_BASE,
            cap: meridian_core::defaults::BACKOFF_CAP,
            attempt: 0,
        }
    }

    /// The delay to wait before the next attempt, with full jitter: a
    /// uniform random value in `[0, min(cap, base * 2^attempt))`.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_millis().saturating_mul(1u128 << self.attempt.min(20));
        let bounded = exp.min(self.cap.as_millis());
        self.attempt += 1;
        let jittered = rand::rng().random_range(0..=bounded.max(1));
        Duration::from_millis(jittered as u64)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `call` against `deadline`, retrying on [`crate::BackendError::Transient`]
/// with the backoff above. Returns [`crate::BackendError::DeadlineExceeded`]
/// once the deadline has passed, leaving the entity for the next reconciler
/// tick rather than blocking the handler indefinitely.
pub async fn with_backoff<F, Fut, T>(deadline: Duration, mut call: F) -> crate::BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::BackendResult<T>>,
{
    let started = tokio::time::Instant::now();
    let mut backoff = Backoff::new();
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(crate::BackendError::Transient(msg)) => {
                if started.elapsed() >= deadline {
                    return Err(crate::BackendError::DeadlineExceeded);
                }
                let delay = backoff.next_delay();
                tracing::debug!(attempt = backoff.attempt(), ?delay, error = %msg, "retrying after transient backend fault");
                let remaining = deadline.saturating_sub(started.elapsed());
                tokio::time::sleep(delay.min(remaining)).await;
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_never_exceed_the_cap() {
        let mut backoff = Backoff::new();
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay <= meridian_core::defaults::BACKOFF_CAP);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result = with_backoff(Duration::from_secs(120), move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n < 2 {
                    Err(crate::BackendError::Transient("rate limited".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_once_the_deadline_passes() {
        let result: crate::BackendResult<()> = with_backoff(Duration::from_millis(1), || async {
            Err(crate::BackendError::Transient("still limited".into()))
        })
        .await;
        assert!(matches!(result, Err(crate::BackendError::DeadlineExceeded)));
    }
}
