//! Lifecycle hooks and their best-effort invocation.
//!
//! Hooks are user code running on worker or sampler tasks. They are
//! side-channels: a panicking hook must never change how many items the
//! pipeline processes, so every invocation goes through `catch_unwind`. The
//! exceptions are [`Hooks::fallback`] and [`Hooks::error`], whose *return
//! values* steer the pipeline; a panic there degrades to the hook being
//! absent.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::ItemFailure;

pub(crate) type StartItemFn = Arc<dyn Fn(u64) + Send + Sync>;
pub(crate) type CompleteItemFn = Arc<dyn Fn(u64) + Send + Sync>;
pub(crate) type TransientFn<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
pub(crate) type FallbackFn<R, E> = Arc<dyn Fn(u64, &ItemFailure<E>) -> R + Send + Sync>;
pub(crate) type RetryFn<E> =
    Arc<dyn Fn(u64, u32, &ItemFailure<E>) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type ErrorFn<E> =
    Arc<dyn Fn(u64, &ItemFailure<E>) -> BoxFuture<'static, bool> + Send + Sync>;
pub(crate) type ThrottleFn = Arc<dyn Fn(usize) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type DrainFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// The configured hook set for one pipeline.
pub(crate) struct Hooks<R, E> {
    pub(crate) on_start_item: Option<StartItemFn>,
    pub(crate) on_complete_item: Option<CompleteItemFn>,
    pub(crate) is_transient: Option<TransientFn<E>>,
    pub(crate) on_fallback: Option<FallbackFn<R, E>>,
    pub(crate) on_retry: Option<RetryFn<E>>,
    pub(crate) on_error: Option<ErrorFn<E>>,
    pub(crate) on_throttle: Option<ThrottleFn>,
    pub(crate) on_drain: Option<DrainFn>,
}

impl<R, E> Default for Hooks<R, E> {
    fn default() -> Self {
        Self {
            on_start_item: None,
            on_complete_item: None,
            is_transient: None,
            on_fallback: None,
            on_retry: None,
            on_error: None,
            on_throttle: None,
            on_drain: None,
        }
    }
}

impl<R, E> Hooks<R, E> {
    pub(crate) fn start_item(&self, index: u64) {
        if let Some(hook) = &self.on_start_item {
            swallow(catch_unwind(AssertUnwindSafe(|| hook(index))));
        }
    }

    pub(crate) fn complete_item(&self, index: u64) {
        if let Some(hook) = &self.on_complete_item {
            swallow(catch_unwind(AssertUnwindSafe(|| hook(index))));
        }
    }

    /// Classifies a transform error. Absent predicate (or a panicking one)
    /// means not transient.
    pub(crate) fn transient(&self, error: &E) -> bool {
        match &self.is_transient {
            Some(predicate) => {
                catch_unwind(AssertUnwindSafe(|| predicate(error))).unwrap_or(false)
            }
            None => false,
        }
    }

    /// Produces the fallback value, if a fallback is configured and does not
    /// panic.
    pub(crate) fn fallback(&self, index: u64, failure: &ItemFailure<E>) -> Option<R> {
        let hook = self.on_fallback.as_ref()?;
        catch_unwind(AssertUnwindSafe(|| hook(index, failure))).ok()
    }

    pub(crate) async fn retry(&self, index: u64, attempt: u32, failure: &ItemFailure<E>) {
        if let Some(hook) = &self.on_retry {
            if let Ok(fut) = catch_unwind(AssertUnwindSafe(|| hook(index, attempt, failure))) {
                swallow(AssertUnwindSafe(fut).catch_unwind().await);
            }
        }
    }

    /// Asks the error hook whether to keep going. `None` when the hook is
    /// absent or panicked.
    pub(crate) async fn error(&self, index: u64, failure: &ItemFailure<E>) -> Option<bool> {
        let hook = self.on_error.as_ref()?;
        let fut = catch_unwind(AssertUnwindSafe(|| hook(index, failure))).ok()?;
        AssertUnwindSafe(fut).catch_unwind().await.ok()
    }

    pub(crate) async fn throttle(&self, in_flight: usize) {
        if let Some(hook) = &self.on_throttle {
            if let Ok(fut) = catch_unwind(AssertUnwindSafe(|| hook(in_flight))) {
                swallow(AssertUnwindSafe(fut).catch_unwind().await);
            }
        }
    }

    pub(crate) async fn drain(&self) {
        if let Some(hook) = &self.on_drain {
            if let Ok(fut) = catch_unwind(AssertUnwindSafe(|| hook())) {
                swallow(AssertUnwindSafe(fut).catch_unwind().await);
            }
        }
    }
}

fn swallow<T>(result: Result<T, Box<dyn std::any::Any + Send>>) {
    if result.is_err() {
        #[cfg(feature = "tracing")]
        tracing::warn!("pipeline hook panicked");
    }
}
