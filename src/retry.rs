/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Fixed-interval retry.

use std::time::Duration;

use crate::context::{Context, ContextError};

/// Implemented by error types that can tell [`retry`] to give up early.
pub trait RetryError: Sized {
    /// Whether the error asks the retry loop to stop.
    fn is_stop_retrying(&self) -> bool;

    /// Wrap an error so that it stops the retry loop.
    fn stop_retrying(self) -> Self;

    /// Build the error returned when the context ends the loop between attempts.
    fn from_context(err: ContextError) -> Self;
}

/// Call `f` until it succeeds, returns an error that [stops retrying](RetryError::is_stop_retrying), or
/// `limit` attempts were made (`None` means no limit). Between attempts the loop sleeps `interval` while
/// observing `ctx`; a done context ends the loop with a stop-retrying error.
///
/// `f` receives the zero-based attempt number.
pub fn retry<T, E, F>(ctx: &Context, limit: Option<u32>, interval: Duration, mut f: F) -> Result<T, E>
where
    E: RetryError,
    F: FnMut(u32) -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        let err = match f(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.is_stop_retrying() {
            return Err(err);
        }

        attempt += 1;
        if limit.is_some_and(|limit| attempt >= limit) {
            return Err(err);
        }

        if let Err(ctx_err) = ctx.sleep(interval) {
            return Err(E::from_context(ctx_err).stop_retrying());
        }
    }
}
