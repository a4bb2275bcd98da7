use std::time::Duration;

/// Retry a fallible operation with exponential backoff.
///
/// # Arguments
/// * `f` - The operation to retry
/// * `max_attempts` - Total number of attempts (at least one is always made)
/// * `base_delay` - Delay after the first failure (doubles each retry)
/// * `operation_name` - Human-readable name for logging
pub fn retry_with_backoff<F, T, E>(
    f: F,
    max_attempts: u32,
    base_delay: Duration,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(f, max_attempts, base_delay, operation_name, |_| true)
}

/// Like [`retry_with_backoff`], but gives up immediately on errors for which
/// `retryable` returns false.
pub fn retry_with_backoff_if<F, T, E, R>(
    mut f: F,
    max_attempts: u32,
    base_delay: Duration,
    operation_name: &str,
    retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let e = match f() {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        attempt += 1;

        if !retryable(&e) {
            tracing::error!("{} failed: {}", operation_name, e);
            return Err(e);
        }
        if attempt >= max_attempts {
            tracing::error!(
                "{} failed after {} attempts: {}",
                operation_name,
                max_attempts,
                e
            );
            return Err(e);
        }

        let delay = base_delay.saturating_mul(2u32.saturating_pow(attempt - 1));
        tracing::warn!(
            "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
            operation_name,
            attempt,
            max_attempts,
            e,
            delay
        );
        std::thread::sleep(delay);
    }
}
