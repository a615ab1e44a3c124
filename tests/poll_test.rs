//! Tests for bounded polling
//!
//! These tests drive `poll_until` with paused time, the way readiness and
//! deletion waits use it.

use std::time::Duration;

use tokio::time::Instant;

use testapp_harness::poll::{poll_until, Attempt, PollError, PollSettings};
use testapp_harness::Error;

fn settings(interval_secs: u64, timeout_secs: u64) -> PollSettings {
    PollSettings {
        interval: Duration::from_secs(interval_secs),
        timeout: Duration::from_secs(timeout_secs),
    }
}

#[test]
fn test_default_poll_settings() {
    let settings = PollSettings::default();
    assert_eq!(settings.interval, Duration::from_secs(1));
    assert_eq!(settings.timeout, Duration::from_secs(600));
}

#[tokio::test(start_paused = true)]
async fn test_resource_becomes_ready_after_a_few_polls() {
    let start = Instant::now();
    let mut observed = 0;

    let result = poll_until(settings(1, 600), || {
        observed += 1;
        let replicas_ready = observed;
        async move {
            if replicas_ready >= 3 {
                Attempt::Ready(replicas_ready)
            } else {
                Attempt::Waiting(replicas_ready)
            }
        }
    })
    .await;

    tokio_test::assert_ok!(&result);
    assert_eq!(result.unwrap(), 3);
    assert_eq!(start.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_last_observation() {
    let start = Instant::now();
    let mut polls = 0;

    let result = poll_until(settings(3, 10), || {
        polls += 1;
        let seen = polls;
        async move { Attempt::<i32>::Waiting(seen) }
    })
    .await;

    match result {
        Err(PollError::Timeout { last, elapsed }) => {
            // polls at 0s, 3s, 6s, 9s and a final one at the 10s deadline
            assert_eq!(last, Some(5));
            assert_eq!(elapsed, Duration::from_secs(10));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(start.elapsed(), Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_stops_polling() {
    let mut polls = 0;

    let result = poll_until(settings(1, 600), || {
        polls += 1;
        async { Attempt::<()>::Fatal(Error::NoPodAvailable { app: "echo".into() }) }
    })
    .await;

    tokio_test::assert_err!(&result);
    assert!(matches!(
        result,
        Err(PollError::Fatal(Error::NoPodAvailable { .. }))
    ));
    assert_eq!(polls, 1);
}
