//! Timing combinators: delay, timeout, exponential retry, and polling.
//!
//! These are the suspension points of an [`IO`] chain. Each combinator is a
//! plain loop over `tokio::time::sleep` / `tokio::time::timeout`; the IO is
//! re-attempted by cloning it, which re-invokes the captured thunk.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{codes, Error};
use crate::io::IO;

impl<T: Send + 'static> IO<T> {
    /// Emits the original outcome no earlier than `duration` from now.
    ///
    /// The timer and the computation run concurrently; predecessor errors
    /// are delayed as well, because the timer always runs to completion.
    pub fn delay(&self, duration: Duration) -> IO<T> {
        let prev = self.clone();
        IO::new(move || {
            let prev = prev.clone();
            async move {
                let (outcome, _) = tokio::join!(prev.run(), tokio::time::sleep(duration));
                outcome
            }
        })
    }

    /// Races the computation against a timer.
    ///
    /// If the timer wins the result is `Err(2, "Operation timed out")` and
    /// the in-flight future is dropped, abandoning whatever work it was
    /// doing. If the computation wins, the timer is cancelled.
    pub fn timeout(&self, duration: Duration) -> IO<T> {
        let prev = self.clone();
        IO::new(move || {
            let prev = prev.clone();
            async move {
                match tokio::time::timeout(duration, prev.run()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::new(codes::TIMEOUT, "Operation timed out")),
                }
            }
        })
    }

    /// Retries the computation with exponentially growing waits while
    /// `should_retry` approves the error.
    ///
    /// At least one attempt always runs. After a retried failure the wait
    /// doubles, starting from `initial_delay`. The last error is returned
    /// once `max_attempts` is reached or the predicate declines.
    pub fn retry_exponential_if<P>(
        &self,
        max_attempts: u32,
        initial_delay: Duration,
        should_retry: P,
    ) -> IO<T>
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        let prev = self.clone();
        let should_retry = Arc::new(should_retry);
        IO::new(move || {
            let prev = prev.clone();
            let should_retry = Arc::clone(&should_retry);
            async move {
                let mut current_delay = initial_delay;
                let mut attempt: u32 = 0;
                loop {
                    attempt += 1;
                    match prev.run().await {
                        Ok(value) => return Ok(value),
                        Err(error) => {
                            if attempt >= max_attempts || !should_retry(&error) {
                                return Err(error);
                            }
                            tracing::debug!(
                                attempt,
                                delay_ms = current_delay.as_millis() as u64,
                                code = error.code,
                                "retrying after failure"
                            );
                            tokio::time::sleep(current_delay).await;
                            current_delay = current_delay.saturating_mul(2);
                        }
                    }
                }
            }
        })
    }

    /// Unconditional [`retry_exponential_if`](IO::retry_exponential_if).
    pub fn retry_exponential(&self, max_attempts: u32, initial_delay: Duration) -> IO<T> {
        self.retry_exponential_if(max_attempts, initial_delay, |_| true)
    }

    /// Re-runs the computation until `satisfied` accepts its value.
    ///
    /// On success with an unsatisfying value the poll waits `interval` and
    /// tries again. On error, polling continues only while `retry_on_error`
    /// approves and attempts remain; otherwise the error propagates.
    /// Exhausting `max_attempts` yields `Err(3, "Polling attempts
    /// exhausted")`.
    pub fn poll_if<P, Q>(
        &self,
        max_attempts: u32,
        interval: Duration,
        satisfied: P,
        retry_on_error: Q,
    ) -> IO<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
        Q: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        let prev = self.clone();
        let satisfied = Arc::new(satisfied);
        let retry_on_error = Arc::new(retry_on_error);
        IO::new(move || {
            let prev = prev.clone();
            let satisfied = Arc::clone(&satisfied);
            let retry_on_error = Arc::clone(&retry_on_error);
            async move {
                let mut attempt: u32 = 0;
                loop {
                    if attempt >= max_attempts {
                        return Err(Error::new(
                            codes::POLL_EXHAUSTED,
                            "Polling attempts exhausted",
                        ));
                    }
                    attempt += 1;
                    match prev.run().await {
                        Ok(value) => {
                            if satisfied(&value) {
                                return Ok(value);
                            }
                        }
                        Err(error) => {
                            if !retry_on_error(&error) || attempt >= max_attempts {
                                return Err(error);
                            }
                        }
                    }
                    tokio::time::sleep(interval).await;
                }
            }
        })
    }

    /// [`poll_if`](IO::poll_if) retrying on every error.
    pub fn poll<P>(&self, max_attempts: u32, interval: Duration, satisfied: P) -> IO<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.poll_if(max_attempts, interval, satisfied, |_| true)
    }
}

/// An IO that succeeds with `()` after `duration`.
pub fn delay_for(duration: Duration) -> IO<()> {
    IO::new(move || async move {
        tokio::time::sleep(duration).await;
        Ok(())
    })
}

/// An IO that succeeds with `value` after `duration`.
pub fn delay_then<T>(duration: Duration, value: T) -> IO<T>
where
    T: Clone + Send + Sync + 'static,
{
    delay_for(duration).map(move |_| value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn counting_io(counter: Arc<AtomicU32>) -> IO<u32> {
        IO::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n) }
        })
    }

    fn flaky_io(counter: Arc<AtomicU32>, failures: u32, value: i32) -> IO<i32> {
        IO::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    Err(Error::new(42, "transient"))
                } else {
                    Ok(value)
                }
            }
        })
    }

    #[tokio::test]
    async fn delay_for_waits_at_least_the_duration() {
        let start = Instant::now();
        delay_for(Duration::from_millis(30)).run().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn delay_also_delays_errors() {
        let start = Instant::now();
        let err = IO::<i32>::fail(Error::new(5, "x"))
            .delay(Duration::from_millis(30))
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.code, 5);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn timeout_beats_a_slow_io() {
        let io = IO::pure(42).delay(Duration::from_millis(100));
        let err = io
            .timeout(Duration::from_millis(20))
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::TIMEOUT);
        assert_eq!(err.what, "Operation timed out");
    }

    #[tokio::test]
    async fn timeout_passes_a_fast_io_through() {
        let io = IO::pure(42).delay(Duration::from_millis(5));
        let value = io
            .timeout(Duration::from_millis(200))
            .run()
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let io = flaky_io(Arc::clone(&attempts), 2, 123);
        let value = io
            .retry_exponential_if(5, Duration::from_millis(1), |_| true)
            .run()
            .await
            .unwrap();
        assert_eq!(value, 123);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_runs_at_most_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let io = flaky_io(Arc::clone(&attempts), u32::MAX, 0);
        let err = io
            .retry_exponential(3, Duration::from_millis(1))
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.code, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_predicate_can_decline() {
        let attempts = Arc::new(AtomicU32::new(0));
        let io = flaky_io(Arc::clone(&attempts), u32::MAX, 0);
        let err = io
            .retry_exponential_if(5, Duration::from_millis(1), |e| e.code != 42)
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.code, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_until_value_satisfies() {
        let counter = Arc::new(AtomicU32::new(0));
        let io = counting_io(Arc::clone(&counter));
        let value = io
            .poll(5, Duration::from_millis(10), |v| *v >= 3)
            .run()
            .await
            .unwrap();
        assert!(value >= 3);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn poll_exhaustion_reports_code_3() {
        let counter = Arc::new(AtomicU32::new(0));
        let io = counting_io(Arc::clone(&counter));
        let err = io
            .poll(4, Duration::from_millis(1), |_| false)
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::POLL_EXHAUSTED);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn poll_propagates_non_retryable_errors() {
        let io = IO::<u32>::fail(Error::new(77, "hard stop"));
        let err = io
            .poll_if(5, Duration::from_millis(1), |_| true, |e| e.code != 77)
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.code, 77);
    }

    #[tokio::test]
    async fn delay_then_carries_the_value() {
        let value = delay_then(Duration::from_millis(5), "ready")
            .run()
            .await
            .unwrap();
        assert_eq!(value, "ready");
    }
}
