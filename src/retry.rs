use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Jittered exponential backoff with a finite attempt budget.
///
/// Used for the two host-side waits: the launcher's PID file showing up, and
/// process-table queries that fail transiently.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        let base_delay_ms = base_delay_ms.max(1);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// Budget for the launcher's PID file: about 12s worst case.
    pub fn pid_file() -> Self {
        Self::new(8, 50, 4_000, 0.1)
    }

    /// Budget for a single process-table query.
    pub fn process_poll() -> Self {
        Self::new(4, 200, 2_000, 0.2)
    }

    /// Delay to sleep after the given (zero based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        if self.jitter_pct == 0.0 {
            return Duration::from_millis(delay);
        }
        let spread = (delay as f64 * self.jitter_pct) as i64;
        let delta = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis(delay.saturating_add_signed(delta))
    }

    /// Run `op` until it succeeds or the attempt budget is spent, returning the
    /// last error in the latter case.
    pub async fn run<F, Fut, T, E>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= self.max_attempts => {
                    tracing::warn!(what, attempts = attempt + 1, error = %e, "Retry budget exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::process_poll()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn new_clamps_parameters() {
        let policy = RetryPolicy::new(0, 0, 0, 3.0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay_ms, 1);
        assert_eq!(policy.max_delay_ms, 1);
        assert_eq!(policy.jitter_pct, 1.0);
    }

    #[test]
    fn delay_doubles_until_cap() {
        let policy = RetryPolicy::new(6, 100, 500, 0.0);
        let delays: Vec<u64> = (0..5)
            .map(|a| policy.delay_for(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn jitter_stays_within_spread() {
        let policy = RetryPolicy::new(3, 1_000, 1_000, 0.25);
        for _ in 0..50 {
            let ms = policy.delay_for(0).as_millis() as u64;
            assert!((750..=1_250).contains(&ms), "delay {} out of range", ms);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_until_success() {
        let policy = RetryPolicy::new(5, 10, 10, 0.0);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<u32, String> = policy
            .run("flaky", |attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err("not yet".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_last_error_when_exhausted() {
        let policy = RetryPolicy::new(3, 10, 10, 0.0);
        let result: Result<(), String> = policy
            .run("doomed", |attempt| async move { Err(format!("failure {}", attempt)) })
            .await;
        assert_eq!(result, Err("failure 2".to_string()));
    }
}
