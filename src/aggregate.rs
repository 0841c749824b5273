//! Combinators over collections of IOs.
//!
//! The sequential forms (`zip_io`, `collect_io`, `all_ok_io`) run strictly
//! left to right and never start an IO whose predecessor failed. The
//! parallel forms bound concurrency with an ordered buffered stream, so the
//! output order always equals the input order regardless of completion
//! order.

use futures::stream::{self, StreamExt};

use crate::io::IO;
use crate::result::ApiResult;

/// Runs two IOs in sequence and pairs their values. The second IO is not
/// started unless the first succeeds.
pub fn zip_io<A, B>(a: IO<A>, b: IO<B>) -> IO<(A, B)>
where
    A: Send + 'static,
    B: Send + 'static,
{
    IO::new(move || {
        let a = a.clone();
        let b = b.clone();
        async move {
            let va = a.run().await?;
            let vb = b.run().await?;
            Ok((va, vb))
        }
    })
}

/// Sequential three-way zip; short-circuits on the first error.
pub fn zip3_io<A, B, C>(a: IO<A>, b: IO<B>, c: IO<C>) -> IO<(A, B, C)>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    IO::new(move || {
        let a = a.clone();
        let b = b.clone();
        let c = c.clone();
        async move {
            let va = a.run().await?;
            let vb = b.run().await?;
            let vc = c.run().await?;
            Ok((va, vb, vc))
        }
    })
}

/// Sequential four-way zip; short-circuits on the first error.
pub fn zip4_io<A, B, C, D>(a: IO<A>, b: IO<B>, c: IO<C>, d: IO<D>) -> IO<(A, B, C, D)>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    D: Send + 'static,
{
    IO::new(move || {
        let a = a.clone();
        let b = b.clone();
        let c = c.clone();
        let d = d.clone();
        async move {
            let va = a.run().await?;
            let vb = b.run().await?;
            let vc = c.run().await?;
            let vd = d.run().await?;
            Ok((va, vb, vc, vd))
        }
    })
}

/// Runs the IOs one after another, collecting values in input order and
/// short-circuiting on the first error.
pub fn collect_io<T: Send + 'static>(items: Vec<IO<T>>) -> IO<Vec<T>> {
    IO::new(move || {
        let items = items.clone();
        async move {
            let mut out = Vec::with_capacity(items.len());
            for io in &items {
                out.push(io.run().await?);
            }
            Ok(out)
        }
    })
}

/// Runs the IOs one after another, recording every per-item outcome. The
/// aggregate itself always succeeds.
pub fn collect_result_io<T: Send + 'static>(items: Vec<IO<T>>) -> IO<Vec<ApiResult<T>>> {
    IO::new(move || {
        let items = items.clone();
        async move {
            let mut out = Vec::with_capacity(items.len());
            for io in &items {
                out.push(io.run().await);
            }
            Ok(out)
        }
    })
}

/// Runs the unit IOs in sequence; succeeds only if all succeed.
pub fn all_ok_io(items: Vec<IO<()>>) -> IO<()> {
    IO::new(move || {
        let items = items.clone();
        async move {
            for io in &items {
                io.run().await?;
            }
            Ok(())
        }
    })
}

/// Runs up to `max_concurrency` IOs at once (default: all at once),
/// collecting values in input order. On the first error the aggregate
/// resolves to that error and any still-pending IOs are dropped.
pub fn collect_io_parallel<T: Send + 'static>(
    items: Vec<IO<T>>,
    max_concurrency: Option<usize>,
) -> IO<Vec<T>> {
    IO::new(move || {
        let items = items.clone();
        async move {
            if items.is_empty() {
                return Ok(Vec::new());
            }
            let limit = max_concurrency.unwrap_or(items.len()).max(1);
            let mut in_flight = stream::iter(items)
                .map(|io| async move { io.run().await })
                .buffered(limit);
            let mut out = Vec::new();
            while let Some(outcome) = in_flight.next().await {
                out.push(outcome?);
            }
            Ok(out)
        }
    })
}

/// Like [`collect_io_parallel`] but records per-item outcomes instead of
/// short-circuiting.
pub fn collect_result_parallel<T: Send + 'static>(
    items: Vec<IO<T>>,
    max_concurrency: Option<usize>,
) -> IO<Vec<ApiResult<T>>> {
    IO::new(move || {
        let items = items.clone();
        async move {
            if items.is_empty() {
                return Ok(Vec::new());
            }
            let limit = max_concurrency.unwrap_or(items.len()).max(1);
            let mut in_flight = stream::iter(items)
                .map(|io| async move { io.run().await })
                .buffered(limit);
            let mut out = Vec::new();
            while let Some(outcome) = in_flight.next().await {
                out.push(outcome);
            }
            Ok(out)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::retry::delay_for;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn zip_builds_tuples_in_order() {
        let io = zip3_io(IO::pure(7), IO::pure("zip"), IO::pure(1.5));
        assert_eq!(io.run().await.unwrap(), (7, "zip", 1.5));
    }

    #[tokio::test]
    async fn zip_short_circuits_and_never_starts_the_tail() {
        let third_started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&third_started);
        let third = IO::new(move || {
            flag.store(true, Ordering::SeqCst);
            async move { Ok(1.5f64) }
        });

        let io = zip3_io(
            IO::pure(7),
            IO::<&str>::fail(Error::new(42, "tuple failure")),
            third,
        );
        assert_eq!(io.run().await.unwrap_err().code, 42);
        assert!(!third_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn collect_preserves_order() {
        let items = vec![IO::pure(1), IO::pure(2), IO::pure(3)];
        assert_eq!(collect_io(items).run().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn collect_short_circuits_on_first_error() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let tail = IO::new(move || {
            flag.store(true, Ordering::SeqCst);
            async move { Ok(3) }
        });
        let items = vec![IO::pure(1), IO::fail(Error::new(9, "mid")), tail];
        assert_eq!(collect_io(items).run().await.unwrap_err().code, 9);
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn collect_result_records_every_outcome() {
        let items = vec![IO::pure(1), IO::fail(Error::new(9, "mid")), IO::pure(3)];
        let outcomes = collect_result_io(items).run().await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0], Ok(1));
        assert_eq!(outcomes[1].as_ref().unwrap_err().code, 9);
        assert_eq!(outcomes[2], Ok(3));
    }

    #[tokio::test]
    async fn all_ok_stops_at_the_first_failure() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let tail = IO::new(move || {
            flag.store(true, Ordering::SeqCst);
            async move { Ok(()) }
        });
        let items = vec![IO::unit(), IO::<()>::fail(Error::new(5, "boom")), tail];
        assert_eq!(all_ok_io(items).run().await.unwrap_err().code, 5);
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn parallel_output_order_matches_input_order() {
        // later items finish first
        let items: Vec<IO<usize>> = (0..5)
            .map(|i| {
                delay_for(Duration::from_millis((5 - i) as u64 * 10)).map(move |_| i)
            })
            .collect();
        let out = collect_io_parallel(items, None).run().await.unwrap();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn parallel_respects_the_concurrency_cap() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<IO<usize>> = (0..8)
            .map(|i| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                IO::new(move || {
                    let current = Arc::clone(&current);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(15)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(i)
                    }
                })
            })
            .collect();

        let out = collect_io_parallel(items, Some(2)).run().await.unwrap();
        assert_eq!(out, (0..8).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn parallel_short_circuits_on_first_error() {
        let items = vec![
            IO::pure(1),
            IO::fail(Error::new(13, "bad")),
            IO::pure(3),
        ];
        let err = collect_io_parallel(items, Some(1)).run().await.unwrap_err();
        assert_eq!(err.code, 13);
    }

    #[tokio::test]
    async fn parallel_result_collects_everything() {
        let items = vec![IO::pure(1), IO::fail(Error::new(13, "bad")), IO::pure(3)];
        let outcomes = collect_result_parallel(items, Some(2)).run().await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_err());
        assert!(outcomes[2].is_ok());
    }
}
