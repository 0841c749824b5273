//! Result aliases and pure aggregators.
//!
//! The success/error algebra itself is `std::result::Result`: tagged `Ok`/
//! `Err` factories, structural equality, loud failure on wrong-state access
//! (`unwrap`/`unwrap_err`), null-sentinel peeks (`as_ref().ok()`), and the
//! full combinator set (`map`, `and_then`, `map_err`, `or_else`,
//! `unwrap_or`, `ok`). This module adds the aliases and the aggregators the
//! standard library does not ship: tuple zips, order-preserving collection,
//! and the all-or-nothing fold over unit results.
//!
//! All aggregators evaluate left to right and short-circuit on the first
//! error.

use crate::error::Error;

/// `Result` specialized to the crate's [`Error`].
pub type ApiResult<T> = Result<T, Error>;

/// `Result` carrying no value, only a possible [`Error`].
pub type VoidResult = ApiResult<()>;

/// Zips two results into a pair, short-circuiting on the first error.
pub fn zip_results<A, B, E>(a: Result<A, E>, b: Result<B, E>) -> Result<(A, B), E> {
    Ok((a?, b?))
}

/// Zips three results into a triple, short-circuiting on the first error.
pub fn zip3_results<A, B, C, E>(
    a: Result<A, E>,
    b: Result<B, E>,
    c: Result<C, E>,
) -> Result<(A, B, C), E> {
    Ok((a?, b?, c?))
}

/// Zips four results, short-circuiting on the first error.
pub fn zip4_results<A, B, C, D, E>(
    a: Result<A, E>,
    b: Result<B, E>,
    c: Result<C, E>,
    d: Result<D, E>,
) -> Result<(A, B, C, D), E> {
    Ok((a?, b?, c?, d?))
}

/// Collects a sequence of results into a vector of values, preserving input
/// order and short-circuiting on the first error.
pub fn collect_results<T, E>(items: impl IntoIterator<Item = Result<T, E>>) -> Result<Vec<T>, E> {
    items.into_iter().collect()
}

/// Succeeds only if every input result succeeded.
pub fn all_ok<E>(items: impl IntoIterator<Item = Result<(), E>>) -> Result<(), E> {
    for item in items {
        item?;
    }
    Ok(())
}
