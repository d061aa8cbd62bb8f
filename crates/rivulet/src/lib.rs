//! Parallel asynchronous stream processing.
//!
//! Rivulet runs a user-supplied asynchronous transform over the items of a
//! stream on a bounded pool of cooperative workers, and hands the results
//! back as a collected `Vec`, a lazy stream, or a bare completion. Between
//! the producer and the consumer sit two bounded queues, so a slow consumer
//! backpressures the workers and a slow source never overfills memory.
//!
//! # Features
//!
//! - **Bounded concurrency**: a hard worker ceiling, plus optional
//!   [adaptive concurrency](AdaptiveOptions) that widens and narrows the
//!   effective limit from observed latency and success rate.
//! - **Resilience per item**: retries with pluggable
//!   [backoff](BackoffStrategy), a transient-error classifier, per-item
//!   timeouts, and a typed fallback value.
//! - **Ordered output**: results can be re-sequenced into source order
//!   while transforms still run out of order.
//! - **Failure routing**: fail fast, collect-and-continue, or a
//!   best-effort mode steered by an async error hook.
//! - **Observability**: lifecycle hooks, a panic-isolated event system,
//!   and an atomic counter sink ([`PipelineMetrics`]).
//!
//! # Examples
//!
//! ## Collected parallel map
//!
//! ```
//! use futures::stream;
//! use rivulet::{map_parallel, ParallelOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let doubled = map_parallel(
//!     stream::iter(1..=100u64),
//!     |x, _cancel| async move { Ok::<_, std::io::Error>(x * 2) },
//!     ParallelOptions::new().max_parallelism(8),
//! )
//! .await?;
//! assert_eq!(doubled.len(), 100);
//! # Ok(())
//! # }
//! ```
//!
//! ## Retries, ordered output, and a fallback
//!
//! ```
//! use std::time::Duration;
//! use futures::stream;
//! use rivulet::{map_parallel, BackoffStrategy, ParallelOptions};
//!
//! #[derive(Debug)]
//! struct FetchError;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ParallelOptions::<String, FetchError>::new()
//!     .name("fetch")
//!     .max_parallelism(16)
//!     .ordered_output(true)
//!     .max_retries(3)
//!     .base_delay(Duration::from_millis(50))
//!     .backoff_strategy(BackoffStrategy::ExponentialJitter)
//!     .is_transient(|_err: &FetchError| true)
//!     .per_item_timeout(Duration::from_secs(2))
//!     .on_fallback(|index, _failure| format!("placeholder-{index}"));
//!
//! let pages = map_parallel(
//!     stream::iter(0..50u32),
//!     |page, _cancel| async move { Ok::<_, FetchError>(format!("page-{page}")) },
//!     options,
//! )
//! .await;
//! # let _ = pages;
//! # Ok(())
//! # }
//! ```
//!
//! ## Lazy consumption
//!
//! ```
//! use futures::{stream, StreamExt};
//! use rivulet::{map_parallel_stream, ParallelOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut results = map_parallel_stream(
//!     stream::iter(0..10u32),
//!     |x, _cancel| async move { Ok::<_, std::io::Error>(x + 1) },
//!     ParallelOptions::new().max_parallelism(4),
//! )?;
//!
//! while let Some(next) = results.next().await {
//!     println!("{}", next?);
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

mod adaptive;
mod backoff;
mod config;
mod error;
mod events;
mod hooks;
mod metrics;
mod pipeline;
mod reorder;
mod retry;
mod worker;

pub use adaptive::{AdaptiveOptions, DecreaseStrategy, IncreaseStrategy};
pub use backoff::BackoffStrategy;
pub use config::{ConfigError, ErrorMode, ParallelOptions};
pub use error::{ItemError, ItemFailure, PipelineError};
pub use events::PipelineEvent;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::ParallelStream;

pub use rivulet_core::events::{EngineEvent, EventListener, EventListeners, FnListener};
pub use tokio_util::sync::CancellationToken;

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};

use crate::retry::Transform;

/// Transforms every item of `source` concurrently and collects the results.
///
/// Results come back in completion order unless
/// [`ordered_output`](ParallelOptions::ordered_output) is set. The call
/// resolves once the whole run has terminated; per-item failures surface
/// according to the configured [`ErrorMode`].
///
/// Must be called from within a tokio runtime.
pub async fn map_parallel<S, T, F, Fut, R, E>(
    source: S,
    transform: F,
    options: ParallelOptions<R, E>,
) -> Result<Vec<R>, PipelineError<E>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Clone + Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: Send + Sync + 'static,
{
    let handle = pipeline::launch(source.map(Ok), erase(transform), options)?;
    handle.collect().await
}

/// Like [`map_parallel`], but over a source that can itself fail.
///
/// An `Err` item from the source is fatal: the pipeline cancels and
/// surfaces [`PipelineError::Source`].
pub async fn try_map_parallel<S, T, F, Fut, R, E>(
    source: S,
    transform: F,
    options: ParallelOptions<R, E>,
) -> Result<Vec<R>, PipelineError<E>>
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Clone + Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: Send + Sync + 'static,
{
    let handle = pipeline::launch(source, erase(transform), options)?;
    handle.collect().await
}

/// Transforms every item of `source` concurrently, yielding results as they
/// become available.
///
/// The returned [`ParallelStream`] yields each output as `Ok` and finishes
/// with at most one terminal `Err`. Invalid options are rejected before any
/// work starts.
///
/// Must be called from within a tokio runtime.
pub fn map_parallel_stream<S, T, F, Fut, R, E>(
    source: S,
    transform: F,
    options: ParallelOptions<R, E>,
) -> Result<ParallelStream<R, E>, PipelineError<E>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Clone + Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: Send + Sync + 'static,
{
    let handle = pipeline::launch(source.map(Ok), erase(transform), options)?;
    Ok(handle.into_stream())
}

/// Runs `action` over every item of `source` concurrently, discarding
/// outputs.
///
/// Must be called from within a tokio runtime.
pub async fn for_each_parallel<S, T, F, Fut, E>(
    source: S,
    action: F,
    options: ParallelOptions<(), E>,
) -> Result<(), PipelineError<E>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Clone + Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Send + Sync + 'static,
{
    let handle = pipeline::launch(source.map(Ok), erase(action), options)?;
    handle.run_to_completion().await
}

fn erase<T, R, E, F, Fut>(transform: F) -> Transform<T, R, E>
where
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    Arc::new(move |value, token| {
        let fut: BoxFuture<'static, Result<R, E>> = Box::pin(transform(value, token));
        fut
    })
}
