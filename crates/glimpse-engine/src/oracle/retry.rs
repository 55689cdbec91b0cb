use std::time::Duration;

use anyhow::Result;
use rand::Rng;

use crate::cancel::CancelToken;
use crate::config::RetryPolicy;
use crate::oracle::transport::is_retryable_error;

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent. Backoff sleeps observe `cancel`.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    label: &str,
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut rng = rand::thread_rng();
    let mut attempt = 1u32;
    loop {
        cancel.check()?;
        let err = match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= max_attempts || !is_retryable_error(&err) {
            return Err(err.context(format!("{label} failed after {attempt} attempt(s)")));
        }
        let delay = jittered(policy.base_delay_for(attempt), policy.jitter, &mut rng);
        log::warn!(
            "{label} attempt {attempt}/{max_attempts} failed: {err:#}; retrying in {}ms",
            delay.as_millis()
        );
        cancel.sleep(delay)?;
        attempt += 1;
    }
}

fn jittered(base: Duration, jitter: f64, rng: &mut impl Rng) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter <= 0.0 || base.is_zero() {
        return base;
    }
    let factor = 1.0 + rng.gen_range(-jitter..=jitter);
    base.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::bail;

    use super::*;
    use crate::oracle::transport::OracleHttpError;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.25,
        }
    }

    fn unavailable() -> anyhow::Error {
        OracleHttpError {
            status: 503,
            body: "overloaded".to_string(),
        }
        .into()
    }

    #[test]
    fn transient_failures_are_retried_until_success() -> anyhow::Result<()> {
        let mut seen = Vec::new();
        let value = retry_with_backoff(&fast_policy(3), &CancelToken::new(), "probe", |attempt| {
            seen.push(attempt);
            if attempt < 3 {
                return Err(unavailable());
            }
            Ok("YES")
        })?;
        assert_eq!(value, "YES");
        assert_eq!(seen, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn attempt_budget_is_bounded() {
        let mut calls = 0;
        let result: anyhow::Result<()> =
            retry_with_backoff(&fast_policy(2), &CancelToken::new(), "probe", |_| {
                calls += 1;
                Err(unavailable())
            });
        let err = result.err().map(|err| format!("{err:#}")).unwrap_or_default();
        assert_eq!(calls, 2);
        assert!(err.contains("probe failed after 2 attempt(s)"));
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let mut calls = 0;
        let result: anyhow::Result<()> =
            retry_with_backoff(&fast_policy(5), &CancelToken::new(), "probe", |_| {
                calls += 1;
                bail!("invalid request payload")
            });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn cancelled_token_stops_before_calling() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut calls = 0;
        let result: anyhow::Result<()> = retry_with_backoff(&fast_policy(3), &cancel, "probe", |_| {
            calls += 1;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(calls, 0);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut rng = rand::thread_rng();
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let delay = jittered(base, 0.25, &mut rng);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
        assert_eq!(jittered(base, 0.0, &mut rng), base);
    }
}
