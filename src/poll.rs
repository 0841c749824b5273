//! Stateful polling with a caller-supplied decision function.
//!
//! [`poll_with_state`] generalizes [`IO::poll_if`](crate::io::IO::poll_if):
//! each attempt builds a fresh job IO from mutable state, and a `decide`
//! function inspects the outcome and steers the loop through
//! [`PollControl`]. Diagnostic [`PollHooks`] can observe every transition
//! but cannot alter the outcome.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{codes, Error};
use crate::io::{catch_panic, IO};
use crate::result::ApiResult;

/// Decision returned by the `decide` function after each attempt.
#[derive(Debug, Clone)]
pub enum PollControl {
    /// Emit the job's result (Ok or Err) as the final outcome.
    Done,
    /// Wait (the given delay, or the default interval) and run the next
    /// attempt.
    Retry(Option<Duration>),
    /// Stop with the given error, or the job's error, or a generic one.
    Fail(Option<Error>),
}

/// Optional observers for [`poll_with_state_or`]. Hooks must not alter the
/// outcome; they exist for diagnostics.
pub struct PollHooks<S> {
    /// Called before each attempt runs.
    pub on_attempt_start: Option<Arc<dyn Fn(u32, &S) + Send + Sync>>,
    /// Called when a retry has been scheduled, with the chosen delay.
    pub on_retry_scheduled: Option<Arc<dyn Fn(u32, &S, Duration) + Send + Sync>>,
    /// Called when the poll resolves successfully.
    pub on_done: Option<Arc<dyn Fn(u32, &S) + Send + Sync>>,
    /// Called when the poll resolves with an error.
    pub on_fail: Option<Arc<dyn Fn(u32, &S, &Error) + Send + Sync>>,
}

impl<S> Default for PollHooks<S> {
    fn default() -> Self {
        PollHooks {
            on_attempt_start: None,
            on_retry_scheduled: None,
            on_done: None,
            on_fail: None,
        }
    }
}

impl<S> Clone for PollHooks<S> {
    fn clone(&self) -> Self {
        PollHooks {
            on_attempt_start: self.on_attempt_start.clone(),
            on_retry_scheduled: self.on_retry_scheduled.clone(),
            on_done: self.on_done.clone(),
            on_fail: self.on_fail.clone(),
        }
    }
}

fn exhausted_error() -> Error {
    Error::new(codes::POLL_EXHAUSTED, "Polling attempts exhausted")
}

/// [`poll_with_state_or`] with the default exhaustion error and no hooks.
pub fn poll_with_state<T, S, J, D>(
    max_attempts: u32,
    default_interval: Duration,
    initial_state: S,
    job: J,
    decide: D,
) -> IO<T>
where
    T: Send + 'static,
    S: Clone + Send + Sync + 'static,
    J: Fn(u32, &mut S) -> IO<T> + Send + Sync + 'static,
    D: Fn(u32, &mut S, &ApiResult<T>) -> PollControl + Send + Sync + 'static,
{
    poll_with_state_or(
        max_attempts,
        default_interval,
        initial_state,
        job,
        decide,
        |_attempts: u32, _state: &mut S, _outcome: ApiResult<T>| exhausted_error(),
        PollHooks::default(),
    )
}

/// Runs `job` up to `max_attempts` times, steering through `decide`.
///
/// Each run starts from a clone of `initial_state`, so a cloned IO replays
/// the whole poll from scratch. Semantics per attempt:
///
/// - [`PollControl::Done`]: the job's result becomes the final outcome.
/// - [`PollControl::Retry`]: wait the given delay (default
///   `default_interval`) and continue; when no attempts remain,
///   `on_exhausted` supplies the final error.
/// - [`PollControl::Fail`]: stop with the explicit error, else the job's
///   error, else a generic failure.
///
/// Panics in `job`, `decide`, or `on_exhausted` become `Err(-1, reason)`
/// and terminate polling.
pub fn poll_with_state_or<T, S, J, D, X>(
    max_attempts: u32,
    default_interval: Duration,
    initial_state: S,
    job: J,
    decide: D,
    on_exhausted: X,
    hooks: PollHooks<S>,
) -> IO<T>
where
    T: Send + 'static,
    S: Clone + Send + Sync + 'static,
    J: Fn(u32, &mut S) -> IO<T> + Send + Sync + 'static,
    D: Fn(u32, &mut S, &ApiResult<T>) -> PollControl + Send + Sync + 'static,
    X: Fn(u32, &mut S, ApiResult<T>) -> Error + Send + Sync + 'static,
{
    let job = Arc::new(job);
    let decide = Arc::new(decide);
    let on_exhausted = Arc::new(on_exhausted);
    IO::new(move || {
        let job = Arc::clone(&job);
        let decide = Arc::clone(&decide);
        let on_exhausted = Arc::clone(&on_exhausted);
        let hooks = hooks.clone();
        let mut state = initial_state.clone();
        async move {
            let mut attempt: u32 = 0;
            loop {
                if attempt >= max_attempts {
                    return Err(exhausted_error());
                }
                attempt += 1;
                if let Some(hook) = hooks.on_attempt_start.as_deref() {
                    hook(attempt, &state);
                }

                let io = catch_panic(|| (*job)(attempt, &mut state))
                    .map_err(|reason| Error::new(codes::MAP_FAILURE, reason))?;
                let outcome = io.run().await;

                let control = catch_panic(|| (*decide)(attempt, &mut state, &outcome))
                    .map_err(|reason| Error::new(codes::MAP_FAILURE, reason))?;

                match control {
                    PollControl::Done => {
                        return match outcome {
                            Ok(value) => {
                                if let Some(hook) = hooks.on_done.as_deref() {
                                    hook(attempt, &state);
                                }
                                Ok(value)
                            }
                            Err(error) => {
                                if let Some(hook) = hooks.on_fail.as_deref() {
                                    hook(attempt, &state, &error);
                                }
                                Err(error)
                            }
                        };
                    }
                    PollControl::Fail(explicit) => {
                        let error = explicit.or_else(|| outcome.err()).unwrap_or_else(|| {
                            Error::new(
                                codes::TIMEOUT,
                                "poll_with_state: fail requested without error",
                            )
                        });
                        if let Some(hook) = hooks.on_fail.as_deref() {
                            hook(attempt, &state, &error);
                        }
                        return Err(error);
                    }
                    PollControl::Retry(delay) => {
                        if attempt >= max_attempts {
                            let error = catch_panic(|| (*on_exhausted)(attempt, &mut state, outcome))
                                .unwrap_or_else(|reason| Error::new(codes::MAP_FAILURE, reason));
                            if let Some(hook) = hooks.on_fail.as_deref() {
                                hook(attempt, &state, &error);
                            }
                            return Err(error);
                        }
                        let wait = delay.unwrap_or(default_interval);
                        if let Some(hook) = hooks.on_retry_scheduled.as_deref() {
                            hook(attempt, &state, wait);
                        }
                        tracing::debug!(attempt, delay_ms = wait.as_millis() as u64, "poll retry scheduled");
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
    })
}
