//! Jittered exponential backoff, independent of the IO combinators.
//!
//! The retry combinators double a delay inline; this state machine exists
//! for callers that manage their own retry cadence (for example around
//! [`poll_with_state`](crate::poll::poll_with_state)) and want a capped,
//! jittered ladder instead.

use std::time::Duration;

use rand::Rng;

/// Tuning for [`JitteredExponentialBackoff`]. Values are sanitized on
/// construction: `initial_delay` is at least 1 ms, `max_delay` at least
/// `initial_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoffOptions {
    /// First delay handed out after a reset.
    pub initial_delay: Duration,
    /// Upper bound for the doubling ladder (jitter excluded).
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to every delay.
    pub jitter: Duration,
}

impl Default for ExponentialBackoffOptions {
    fn default() -> Self {
        ExponentialBackoffOptions {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: Duration::ZERO,
        }
    }
}

/// Doubling backoff ladder with optional uniform jitter.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tidewater::{ExponentialBackoffOptions, JitteredExponentialBackoff};
///
/// let mut backoff = JitteredExponentialBackoff::new(ExponentialBackoffOptions {
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(1),
///     jitter: Duration::ZERO,
/// });
/// let mut rng = rand::thread_rng();
/// assert_eq!(backoff.next_delay(&mut rng), Duration::from_millis(100));
/// assert_eq!(backoff.next_delay(&mut rng), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone)]
pub struct JitteredExponentialBackoff {
    options: ExponentialBackoffOptions,
    current_delay: Duration,
}

impl JitteredExponentialBackoff {
    /// Creates a backoff with sanitized options and a zeroed current delay.
    pub fn new(options: ExponentialBackoffOptions) -> Self {
        JitteredExponentialBackoff {
            options: Self::sanitize(options),
            current_delay: Duration::ZERO,
        }
    }

    /// Replaces the options, clamping the current delay to the new maximum.
    pub fn update_options(&mut self, options: ExponentialBackoffOptions) {
        self.options = Self::sanitize(options);
        if self.current_delay > self.options.max_delay {
            self.current_delay = self.options.max_delay;
        }
    }

    /// Sets the current delay back to zero; the next delay will be
    /// `initial_delay` again.
    pub fn reset(&mut self) {
        self.current_delay = Duration::ZERO;
    }

    /// The delay most recently handed out, without jitter.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Advances the ladder and returns the next wait: zero becomes
    /// `initial_delay`, anything else doubles up to `max_delay`, and a
    /// uniform sample from `[0, jitter]` is added on top.
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Duration {
        if self.current_delay.is_zero() {
            self.current_delay = self.options.initial_delay;
        } else {
            self.current_delay = self.current_delay.saturating_mul(2).min(self.options.max_delay);
        }
        self.current_delay + self.sample_jitter(rng)
    }

    fn sample_jitter<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.options.jitter.is_zero() {
            return Duration::ZERO;
        }
        let bound = self.options.jitter.as_millis() as u64;
        Duration::from_millis(rng.gen_range(0..=bound))
    }

    fn sanitize(mut options: ExponentialBackoffOptions) -> ExponentialBackoffOptions {
        if options.initial_delay < Duration::from_millis(1) {
            options.initial_delay = Duration::from_millis(1);
        }
        if options.max_delay < options.initial_delay {
            options.max_delay = options.initial_delay;
        }
        options
    }
}

impl Default for JitteredExponentialBackoff {
    fn default() -> Self {
        JitteredExponentialBackoff::new(ExponentialBackoffOptions::default())
    }
}
