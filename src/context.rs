/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cancellation and deadlines for long-running work.
//!
//! A [`Context`] is handed to every prepare and save attempt. It is done when it, or any of its parents,
//! is cancelled through a [`CancelHandle`] or reaches its deadline. Work observes it by polling
//! [`Context::err`] at its own suspension points, or by sleeping through [`Context::sleep`], which
//! wakes up early when the context is done.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;

/// Granularity at which [`Context::sleep`] checks for cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    parent: Option<Context>,
    canceled: AtomicBool,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never done.
    pub fn background() -> Context {
        Context {
            inner: Arc::new(ContextInner {
                parent: None,
                canceled: AtomicBool::new(false),
                deadline: None,
            }),
        }
    }

    fn child(&self, deadline: Option<Instant>) -> (Context, CancelHandle) {
        let child = Context {
            inner: Arc::new(ContextInner {
                parent: Some(self.clone()),
                canceled: AtomicBool::new(false),
                deadline,
            }),
        };
        let handle = CancelHandle(child.clone());
        (child, handle)
    }

    /// A child context that is done when `self` is, or when the returned handle is cancelled.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        self.child(None)
    }

    /// A child context that is additionally done after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.child(Some(Instant::now() + timeout))
    }

    /// `None` while the context is live, otherwise why it is done.
    pub fn err(&self) -> Option<ContextError> {
        let mut current = Some(self);
        while let Some(context) = current {
            if context.inner.canceled.load(Ordering::Acquire) {
                return Some(ContextError::Canceled);
            }
            if let Some(deadline) = context.inner.deadline {
                if Instant::now() >= deadline {
                    return Some(ContextError::DeadlineExceeded);
                }
            }
            current = context.inner.parent.as_ref();
        }

        None
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Sleep for `duration`, returning early with the context's error if it becomes done.
    pub fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        let until = Instant::now() + duration;
        loop {
            if let Some(err) = self.err() {
                return Err(err);
            }
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep((until - now).min(SLEEP_SLICE));
        }
    }
}

/// Cancels the context it was created with, and through it every descendant.
#[derive(Clone)]
pub struct CancelHandle(Context);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.inner.canceled.store(true, Ordering::Release);
    }
}
