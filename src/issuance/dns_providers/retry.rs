use anyhow::{Result, anyhow};
use log::{debug, warn};
use std::time::{Duration, Instant};

/// Runs `operation` up to `max_attempts` times, sleeping `delay` between failures.
/// Returns the first success or the last error.
pub fn retry_with_backoff<T, F>(mut operation: F, max_attempts: u32, delay: Duration) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(err) if attempt >= max_attempts => return Err(err),
            Err(err) => {
                debug!(
                    "[dns-retry] Operation failed (attempt {}), retrying in {}ms: {}",
                    attempt,
                    delay.as_millis(),
                    err
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Retries a provider-side check until it reports `Ok(true)` or `timeout` elapses.
///
/// The closure returns `Ok(true)` when verified, `Ok(false)` to retry, and `Err(_)`
/// to fail immediately.
pub fn retry_provider_verification<F>(
    record_name: &str,
    operation: &str,
    timeout: Duration,
    interval: Duration,
    mut verify_fn: F,
) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(
            "[provider-retry] {} verification attempt {} for {}",
            operation, attempt, record_name
        );

        match verify_fn() {
            Ok(true) => return Ok(()),
            Ok(false) => {
                if started.elapsed() >= timeout {
                    warn!(
                        "[provider-retry] {} verification timeout after {}ms (attempt {})",
                        operation,
                        started.elapsed().as_millis(),
                        attempt
                    );
                    return Err(anyhow!(
                        "{} verification failed for {}: timeout after {}ms",
                        operation,
                        record_name,
                        started.elapsed().as_millis()
                    ));
                }
                std::thread::sleep(interval);
            }
            Err(e) => {
                warn!(
                    "[provider-retry] {} verification failed immediately: {}",
                    operation, e
                );
                return Err(e);
            }
        }
    }
}
