//! Bounded "wait until ready" polling
//!
//! Every wait in the harness goes through [`poll_until`]: the check runs
//! immediately, then once per interval, until it reports ready, reports a
//! fatal error, or the timeout elapses.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::error::Error;

/// How often e2e tests poll for updates.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How long e2e tests wait for resource updates when polling.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: POLL_INTERVAL,
            timeout: POLL_TIMEOUT,
        }
    }
}

/// Result of one observation attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// Desired state reached
    Ready(T),
    /// Not there yet, keep polling. Carries what was observed.
    Waiting(T),
    /// Not ready and broken; stop immediately
    Fatal(Error),
}

#[derive(Debug)]
pub enum PollError<T> {
    /// The check failed in a way that will not resolve by waiting
    Fatal(Error),
    /// Deadline passed; `last` is the final observation, if any
    Timeout { last: Option<T>, elapsed: Duration },
}

/// Polls `check` until it reports [`Attempt::Ready`].
///
/// The check is always invoked at least once, even with a zero timeout.
/// The last sleep is clamped to the remaining deadline so the call returns
/// within `timeout + interval` plus the time spent inside `check`.
pub async fn poll_until<T, F, Fut>(
    settings: PollSettings,
    mut check: F,
) -> std::result::Result<T, PollError<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let start = Instant::now();
    let deadline = start + settings.timeout;
    let mut last = None;

    loop {
        match check().await {
            Attempt::Ready(value) => return Ok(value),
            Attempt::Fatal(err) => return Err(PollError::Fatal(err)),
            Attempt::Waiting(observed) => last = Some(observed),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout {
                last,
                elapsed: now - start,
            });
        }

        sleep(settings.interval.min(deadline - now)).await;
    }
}
