//! The pluggable per-delivery failure-pacing [`Backoff`] strategy.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// A pluggable policy that paces delivery processing and reacts to delivery outcomes.
///
/// One instance is owned per [`crate::consumer::Consumer`] (never shared across
/// consumers, per the "no required global state" design note). The runtime calls
/// `take` before handing a delivery to the middleware/handler pipeline, and calls
/// exactly one of `pass`/`nack` after the pipeline settles (`nack` for every
/// middleware/handler failure, regardless of its kind), plus `ack` whenever the
/// message is actually acknowledged. `fail` is not called by the runtime directly —
/// it is an implementation's own signal, raised from within `nack` once repeated
/// failures cross whatever threshold that implementation tracks.
#[async_trait]
pub trait Backoff: Send + Sync {
    /// Awaits permission to process the next delivery. May suspend.
    async fn take(&self);

    /// Reports that a delivery was processed successfully.
    async fn pass(&self);

    /// Reports that the handler or a middleware layer failed for this delivery.
    /// Implementations that pace on repeated failures should do their accounting
    /// here and call their own `fail` once the threshold is crossed.
    async fn nack(&self);

    /// Reports that a delivery was explicitly acknowledged.
    async fn ack(&self);

    /// Raised by an implementation's own `nack` once failures have crossed its
    /// threshold for suspending future `take` calls.
    async fn fail(&self);
}

/// The default [`Backoff`]: counts failures in a sliding window and, once more than
/// `fail_threshold` failures have landed within `fail_span`, suspends the next `take`
/// for `fail_timeout` before admitting further deliveries.
///
/// This is the `(failThreshold, failSpan, failTimeout)` knobs from the Chain State,
/// kept here rather than duplicated onto every consumer.
pub struct SlidingWindowBackoff {
    fail_threshold: usize,
    fail_span: Duration,
    fail_timeout: Duration,
    failures: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowBackoff {
    /// Constructs a new sliding-window backoff with the given knobs.
    #[must_use]
    pub fn new(fail_threshold: usize, fail_span: Duration, fail_timeout: Duration) -> Self {
        Self {
            fail_threshold,
            fail_span,
            fail_timeout,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Drops failure timestamps older than `fail_span` and returns the remaining
    /// count, recording `now` as a new failure.
    fn record_failure_and_count(&self, now: Instant) -> usize {
        let mut failures = self.failures.lock().expect("backoff mutex poisoned");
        failures.push_back(now);
        while let Some(&front) = failures.front() {
            if now.duration_since(front) > self.fail_span {
                failures.pop_front();
            } else {
                break;
            }
        }
        failures.len()
    }
}

impl Default for SlidingWindowBackoff {
    /// Matches the Chain State defaults: a generous threshold so that `take` never
    /// suspends unless the caller explicitly tightened the knobs.
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5), Duration::from_secs(5))
    }
}

#[async_trait]
impl Backoff for SlidingWindowBackoff {
    async fn take(&self) {
        // No gate to check here; `nack` raises `fail` inline once the window crosses
        // threshold, so suspension happens on the failing call rather than on the
        // following `take`, and `take` itself stays lock-free.
    }

    async fn pass(&self) {
        debug!("backoff: delivery processed successfully");
    }

    async fn nack(&self) {
        debug!("backoff: delivery failed (handler/middleware error)");
        let now = Instant::now();
        let count = self.record_failure_and_count(now);
        if count > self.fail_threshold {
            self.fail().await;
        }
    }

    async fn ack(&self) {
        debug!("backoff: delivery acknowledged");
    }

    async fn fail(&self) {
        warn!(
            threshold = self.fail_threshold,
            timeout_ms = self.fail_timeout.as_millis(),
            "backoff: failure threshold crossed, suspending next take()"
        );
        sleep(self.fail_timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fail_timeout_not_triggered_below_threshold() {
        let backoff = SlidingWindowBackoff::new(3, Duration::from_secs(5), Duration::from_millis(50));
        let start = Instant::now();
        backoff.nack().await;
        backoff.nack().await;
        // Only 2 failures registered; threshold is 3, so `nack` should not suspend.
        assert!(start.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn fail_timeout_triggered_above_threshold() {
        let backoff = SlidingWindowBackoff::new(1, Duration::from_secs(5), Duration::from_millis(30));
        backoff.nack().await;
        let start = Instant::now();
        // The second failure within the window crosses the threshold, so this
        // `nack` call should itself raise `fail` and suspend inline.
        backoff.nack().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn old_failures_fall_out_of_the_window() {
        let backoff = SlidingWindowBackoff::new(1, Duration::from_millis(20), Duration::from_millis(10));
        backoff.nack().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let start = Instant::now();
        // The first failure has aged out of the 20ms window, so this is only the
        // first failure in the *current* window and should not trigger the timeout.
        backoff.nack().await;
        assert!(start.elapsed() < Duration::from_millis(8));
    }

    #[tokio::test]
    async fn fail_is_raised_directly_when_called_on_its_own() {
        // `fail` itself does no accounting; calling it directly always suspends,
        // independent of the sliding window `nack` maintains.
        let backoff = SlidingWindowBackoff::new(5, Duration::from_secs(5), Duration::from_millis(30));
        let start = Instant::now();
        backoff.fail().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}

/// A `Backoff` stub used to verify exact call ordering against the testable
/// properties (`take, pass, take, nack`, plus `fail` iff the threshold is crossed).
#[cfg(test)]
pub(crate) mod test_support {
    use super::{async_trait, Backoff};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingBackoff {
        pub(crate) calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Backoff for RecordingBackoff {
        async fn take(&self) {
            self.calls.lock().unwrap().push("take");
        }

        async fn pass(&self) {
            self.calls.lock().unwrap().push("pass");
        }

        async fn nack(&self) {
            self.calls.lock().unwrap().push("nack");
        }

        async fn ack(&self) {
            self.calls.lock().unwrap().push("ack");
        }

        async fn fail(&self) {
            self.calls.lock().unwrap().push("fail");
        }
    }
}
