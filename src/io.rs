//! The deferred asynchronous computation at the heart of the crate.
//!
//! An [`IO<T>`] wraps a re-invocable thunk producing a future of
//! `Result<T, Error>`. Nothing runs until [`IO::run`] is awaited, and a
//! cloned `IO` re-executes the captured thunk from scratch, which is what
//! lets the retry and poll combinators attempt the same work repeatedly.
//!
//! Composition never consumes the source: every combinator takes `&self`
//! and returns a new `IO`, so a chain can be built once and run many times.
//!
//! # Examples
//!
//! ```
//! use tidewater::IO;
//!
//! # async fn demo() -> Result<(), tidewater::Error> {
//! let io = IO::pure(10)
//!     .map(|x| x + 2)
//!     .then(|x| IO::pure(x.to_string()));
//! assert_eq!(io.run().await?, "12");
//! // the chain is reusable
//! assert_eq!(io.run().await?, "12");
//! # Ok(())
//! # }
//! ```
//!
//! Panics raised by user closures are caught at the combinator boundary and
//! mapped to the reserved codes: `map` to −1, `then` to −2, `catch_then` to
//! −3.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{codes, Error};
use crate::result::ApiResult;

type Thunk<T> = Arc<dyn Fn() -> BoxFuture<'static, ApiResult<T>> + Send + Sync>;

/// A lazily-evaluated asynchronous computation producing `Result<T, Error>`.
pub struct IO<T> {
    thunk: Thunk<T>,
}

impl<T> Clone for IO<T> {
    fn clone(&self) -> Self {
        IO {
            thunk: Arc::clone(&self.thunk),
        }
    }
}

pub(crate) fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

/// Runs `f`, converting a panic into its textual reason.
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(panic_reason)
}

impl<T: Send + 'static> IO<T> {
    /// Wraps an async thunk. The thunk may be invoked any number of times
    /// (once per [`run`](IO::run) of this IO or any of its clones).
    pub fn new<F, Fut>(thunk: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
    {
        IO {
            thunk: Arc::new(move || thunk().boxed()),
        }
    }

    /// An IO that immediately succeeds with `value`.
    pub fn pure(value: T) -> Self
    where
        T: Clone + Sync,
    {
        IO::new(move || {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    /// An IO that immediately fails with `error`.
    pub fn fail(error: Error) -> Self {
        IO::new(move || {
            let error = error.clone();
            async move { Err(error) }
        })
    }

    /// Lifts an already-computed result.
    pub fn from_result(result: ApiResult<T>) -> Self
    where
        T: Clone + Sync,
    {
        IO::new(move || {
            let result = result.clone();
            async move { result }
        })
    }

    /// Executes the computation once and returns its outcome.
    pub async fn run(&self) -> ApiResult<T> {
        (self.thunk)().await
    }

    /// Applies a pure transform on success. A panic in `f` becomes
    /// `Err(-1, reason)`; a predecessor error passes through unchanged.
    pub fn map<U, F>(&self, f: F) -> IO<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let prev = self.clone();
        let f = Arc::new(f);
        IO::new(move || {
            let prev = prev.clone();
            let f = Arc::clone(&f);
            async move {
                let value = prev.run().await?;
                catch_panic(move || (*f)(value))
                    .map_err(|reason| Error::new(codes::MAP_FAILURE, reason))
            }
        })
    }

    /// Sequences a dependent IO on success (flat-map). A panic in `f`
    /// becomes `Err(-2, reason)`; an error from the produced IO surfaces
    /// as-is.
    pub fn then<U, F>(&self, f: F) -> IO<U>
    where
        U: Send + 'static,
        F: Fn(T) -> IO<U> + Send + Sync + 'static,
    {
        let prev = self.clone();
        let f = Arc::new(f);
        IO::new(move || {
            let prev = prev.clone();
            let f = Arc::clone(&f);
            async move {
                let value = prev.run().await?;
                let next = catch_panic(move || (*f)(value))
                    .map_err(|reason| Error::new(codes::SEQUENCE_FAILURE, reason))?;
                next.run().await
            }
        })
    }

    /// Recovers from an error by running a fallback IO. A panic in `f`
    /// becomes `Err(-3, reason)`; success passes through untouched.
    pub fn catch_then<F>(&self, f: F) -> IO<T>
    where
        F: Fn(Error) -> IO<T> + Send + Sync + 'static,
    {
        let prev = self.clone();
        let f = Arc::new(f);
        IO::new(move || {
            let prev = prev.clone();
            let f = Arc::clone(&f);
            async move {
                match prev.run().await {
                    Ok(value) => Ok(value),
                    Err(error) => {
                        let next = catch_panic(move || (*f)(error))
                            .map_err(|reason| Error::new(codes::RECOVER_FAILURE, reason))?;
                        next.run().await
                    }
                }
            }
        })
    }

    /// Transforms the error; success passes through.
    pub fn map_err<F>(&self, f: F) -> IO<T>
    where
        F: Fn(Error) -> Error + Send + Sync + 'static,
    {
        let prev = self.clone();
        let f = Arc::new(f);
        IO::new(move || {
            let prev = prev.clone();
            let f = Arc::clone(&f);
            async move { prev.run().await.map_err(|error| (*f)(error)) }
        })
    }

    /// Runs a side effect regardless of outcome, then emits the original
    /// result.
    pub fn finally<F>(&self, f: F) -> IO<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let prev = self.clone();
        let f = Arc::new(f);
        IO::new(move || {
            let prev = prev.clone();
            let f = Arc::clone(&f);
            async move {
                let outcome = prev.run().await;
                (*f)();
                outcome
            }
        })
    }

    /// Runs a cleanup IO for its side effects, then emits the original
    /// result. Errors from the cleanup IO are swallowed, and a panic in
    /// the factory itself still preserves the original result.
    pub fn finally_then<F>(&self, f: F) -> IO<T>
    where
        F: Fn() -> IO<()> + Send + Sync + 'static,
    {
        let prev = self.clone();
        let f = Arc::new(f);
        IO::new(move || {
            let prev = prev.clone();
            let f = Arc::clone(&f);
            async move {
                let outcome = prev.run().await;
                if let Ok(cleanup) = catch_panic(|| (*f)()) {
                    let _ = cleanup.run().await;
                }
                outcome
            }
        })
    }
}

impl IO<()> {
    /// The unit IO: succeeds immediately with `()`.
    pub fn unit() -> IO<()> {
        IO::new(|| async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn pure_map_then() {
        let io = IO::pure(10)
            .map(|x| x + 2)
            .then(|x| IO::pure(x.to_string()));
        assert_eq!(io.run().await.unwrap(), "12");
    }

    #[tokio::test]
    async fn map_identity_and_composition() {
        let io = IO::pure(5);
        assert_eq!(io.map(|v| v).run().await.unwrap(), io.run().await.unwrap());

        let composed = io.map(|v| v + 1).map(|v| v * 2);
        let fused = io.map(|v| (v + 1) * 2);
        assert_eq!(composed.run().await.unwrap(), fused.run().await.unwrap());
    }

    #[tokio::test]
    async fn panics_map_to_reserved_codes() {
        let map_panic = IO::pure(1).map(|_: i32| -> i32 { panic!("boom") });
        assert_eq!(map_panic.run().await.unwrap_err().code, codes::MAP_FAILURE);

        let then_panic = IO::pure(1).then(|_: i32| -> IO<i32> { panic!("kapow") });
        assert_eq!(
            then_panic.run().await.unwrap_err().code,
            codes::SEQUENCE_FAILURE
        );

        let catch_panic_io =
            IO::<i32>::fail(Error::new(9, "x")).catch_then(|_| -> IO<i32> { panic!("oops") });
        assert_eq!(
            catch_panic_io.run().await.unwrap_err().code,
            codes::RECOVER_FAILURE
        );
    }

    #[tokio::test]
    async fn fail_short_circuits_then() {
        let called = Arc::new(AtomicU32::new(0));
        let called_in = Arc::clone(&called);
        let io = IO::<i32>::fail(Error::new(42, "nope")).then(move |v| {
            called_in.fetch_add(1, Ordering::SeqCst);
            IO::pure(v)
        });
        assert_eq!(io.run().await.unwrap_err().code, 42);
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn catch_then_recovers_and_map_err_transforms() {
        let recovered = IO::<i32>::fail(Error::new(1, "fail"))
            .catch_then(|_| IO::pure(5));
        assert_eq!(recovered.run().await.unwrap(), 5);

        let mapped = IO::<i32>::fail(Error::new(2, "e"))
            .map_err(|e| Error::new(e.code + 1, format!("{}!", e.what)));
        let err = mapped.run().await.unwrap_err();
        assert_eq!(err.code, 3);
        assert_eq!(err.what, "e!");
    }

    #[tokio::test]
    async fn finally_runs_on_both_outcomes() {
        let count = Arc::new(AtomicU32::new(0));

        let on_ok = Arc::clone(&count);
        IO::pure(1)
            .finally(move || {
                on_ok.fetch_add(1, Ordering::SeqCst);
            })
            .run()
            .await
            .unwrap();

        let on_err = Arc::clone(&count);
        let err = IO::<i32>::fail(Error::new(7, "x"))
            .finally(move || {
                on_err.fetch_add(1, Ordering::SeqCst);
            })
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.code, 7);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn finally_then_preserves_outcome_and_swallows_cleanup_errors() {
        let preserved = IO::pure(11)
            .finally_then(|| IO::<()>::fail(Error::new(99, "cleanup failed")));
        assert_eq!(preserved.run().await.unwrap(), 11);

        let panicking = IO::pure(12).finally_then(|| -> IO<()> { panic!("cleanup panic") });
        assert_eq!(panicking.run().await.unwrap(), 12);

        let original_err = IO::<i32>::fail(Error::new(3, "orig"))
            .finally_then(IO::unit);
        assert_eq!(original_err.run().await.unwrap_err().code, 3);
    }

    #[tokio::test]
    async fn clone_reruns_the_thunk() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_in = Arc::clone(&counter);
        let io = IO::new(move || {
            let n = counter_in.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n) }
        });

        assert_eq!(io.run().await.unwrap(), 0);
        let cloned = io.clone();
        assert_eq!(cloned.run().await.unwrap(), 1);
        assert_eq!(io.run().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn from_result_replays_either_state() {
        let ok = IO::from_result(Ok::<_, Error>(8));
        assert_eq!(ok.run().await.unwrap(), 8);
        assert_eq!(ok.run().await.unwrap(), 8);

        let err = IO::<i32>::from_result(Err(Error::new(4, "bad")));
        assert_eq!(err.run().await.unwrap_err().code, 4);
    }

    #[tokio::test]
    async fn unit_flows_through_void_chain() {
        let side = Arc::new(AtomicU32::new(0));
        let side_in = Arc::clone(&side);
        let io = IO::unit()
            .map(move |_| {
                side_in.fetch_add(1, Ordering::SeqCst);
            })
            .then(|_| IO::pure(7));
        assert_eq!(io.run().await.unwrap(), 7);
        assert_eq!(side.load(Ordering::SeqCst), 1);
    }
}
