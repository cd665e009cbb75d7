use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use appointment_notifier::{
    error::PipelineError,
    models::retry::RetryConfig,
    utils::{jittered, retry_with_backoff},
};

fn fast_config(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 10,
        max_delay_ms: 40,
        backoff_multiplier: 2,
    }
}

/// Test: A broker that comes up on the third attempt is reached without surfacing an error
#[tokio::test]
async fn test_connection_retried_until_available() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let result = retry_with_backoff(&fast_config(5), "rabbitmq", || {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(PipelineError::Connection("connection refused".to_string()))
            } else {
                Ok("connected")
            }
        }
    })
    .await?;

    assert_eq!(result, "connected");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    Ok(())
}

/// Test: The last error is returned once all attempts are used
#[tokio::test]
async fn test_gives_up_after_max_attempts() -> Result<()> {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let result = retry_with_backoff(&fast_config(4), "rabbitmq", || {
        let counter = Arc::clone(&counter);
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(PipelineError::Connection(format!("attempt {}", n + 1)))
        }
    })
    .await;

    let err = result.expect_err("Should fail after max attempts");
    assert_eq!(err.to_string(), "Broker connection failed: attempt 4");
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    Ok(())
}

/// Test: Redelivery delays double per attempt and stop at the cap
#[test]
fn test_redelivery_delays_grow_and_cap() {
    let config = RetryConfig {
        max_attempts: 6,
        initial_delay_ms: 500,
        max_delay_ms: 3_000,
        backoff_multiplier: 2,
    };

    let delays: Vec<u64> = (1..=6)
        .map(|attempt| config.delay_for_attempt(attempt).as_millis() as u64)
        .collect();

    assert_eq!(delays, vec![500, 1_000, 2_000, 3_000, 3_000, 3_000]);
}

/// Test: Jitter stays within ten percent of the base delay
#[test]
fn test_jitter_bounds() {
    let base = Duration::from_millis(1_000);

    for _ in 0..200 {
        let delay = jittered(base).as_millis();
        assert!(
            (900..=1_100).contains(&delay),
            "Jittered delay {} out of bounds",
            delay
        );
    }
}

/// Test: Concurrent startups keep independent attempt counters
#[tokio::test]
async fn test_concurrent_retries_are_independent() -> Result<()> {
    let config = Arc::new(fast_config(3));
    let mut handles = Vec::new();

    for i in 0..6u32 {
        let config = Arc::clone(&config);
        handles.push(tokio::spawn(async move {
            let attempts = Arc::new(AtomicU32::new(0));
            let counter = Arc::clone(&attempts);

            let result = retry_with_backoff(&config, "postgres", || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if i % 2 == 0 && n == 0 {
                        Err(PipelineError::TransientStore("too many connections".into()))
                    } else {
                        Ok(i)
                    }
                }
            })
            .await;

            (result.is_ok(), attempts.load(Ordering::SeqCst))
        }));
    }

    for (i, outcome) in futures_util::future::join_all(handles)
        .await
        .into_iter()
        .enumerate()
    {
        let (succeeded, attempts) = outcome?;
        assert!(succeeded, "startup {} should succeed", i);
        assert_eq!(attempts, if i % 2 == 0 { 2 } else { 1 });
    }

    Ok(())
}
