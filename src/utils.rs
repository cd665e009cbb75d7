use std::{fmt::Display, future::Future};

use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use crate::models::retry::RetryConfig;

/// Spreads a delay by ±10% so restarted consumers do not retry in lockstep.
pub fn jittered(delay: Duration) -> Duration {
    let jitter = rand::random_range(-0.1..=0.1);

    Duration::from_millis((delay.as_millis() as f64 * (1.0 + jitter)) as u64)
}

/// Runs `operation` until it succeeds or `config.max_attempts` is reached,
/// sleeping a jittered exponential delay between attempts. `target` names
/// the dependency being waited on in logs.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    target: &str,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(target_name = target, attempt, "Dependency reachable after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if attempt >= config.max_attempts {
            warn!(
                target_name = target,
                attempts = attempt,
                error = %error,
                "Giving up on dependency"
            );
            return Err(error);
        }

        let delay = jittered(config.delay_for_attempt(attempt));
        warn!(
            target_name = target,
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Dependency unavailable, backing off"
        );

        sleep(delay).await;
        attempt += 1;
    }
}
