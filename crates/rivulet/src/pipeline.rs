//! Pipeline wiring and lifecycle.
//!
//! `launch` validates the options and spawns the moving parts: one producer
//! task feeding the input queue, `max_parallelism` workers, and an optional
//! adaptive sampler. A coordinator task joins them in termination order
//! (producer, workers, sampler), closes the output queue exactly once,
//! fires the drain hook, and resolves the terminal signal. The consumer
//! half drains the output queue, optionally re-sequencing through the
//! reorder buffer, and observes the terminal signal last.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use rivulet_core::queue::BoundedQueue;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::adaptive::AdaptiveController;
use crate::config::ParallelOptions;
use crate::error::{ItemError, PipelineError};
use crate::events::{Emitter, PipelineEvent};
use crate::reorder::ReorderBuffer;
use crate::retry::{RetryPolicy, Transform};
use crate::worker::{run_worker, WorkerContext};

/// Collects per-item failures and the fatal producer error, if any.
pub(crate) struct Aggregator<E> {
    inner: Mutex<AggregatorState<E>>,
}

struct AggregatorState<E> {
    errors: Vec<ItemError<E>>,
    source_error: Option<E>,
    fail_fast: bool,
}

impl<E> Default for AggregatorState<E> {
    fn default() -> Self {
        Self {
            errors: Vec::new(),
            source_error: None,
            fail_fast: false,
        }
    }
}

impl<E> Aggregator<E> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(AggregatorState::default()),
        }
    }

    pub(crate) fn record(&self, error: ItemError<E>) {
        self.inner.lock().unwrap().errors.push(error);
    }

    pub(crate) fn record_fail_fast(&self, error: ItemError<E>) {
        let mut state = self.inner.lock().unwrap();
        state.fail_fast = true;
        state.errors.push(error);
    }

    /// First source error wins; later ones raced the shutdown.
    pub(crate) fn record_source_error(&self, error: E) {
        let mut state = self.inner.lock().unwrap();
        if state.source_error.is_none() {
            state.source_error = Some(error);
        }
    }

    fn take(&self) -> AggregatorState<E> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }
}

/// The consumer half of a launched pipeline.
pub(crate) struct PipelineHandle<R, E> {
    output: Arc<BoundedQueue<(u64, R)>>,
    terminal: oneshot::Receiver<Option<PipelineError<E>>>,
    ordered: bool,
    shutdown: CancellationToken,
}

/// Validates the options and spawns producer, workers, sampler, and
/// coordinator. Returns without blocking; all progress happens on the
/// spawned tasks.
pub(crate) fn launch<S, T, R, E>(
    source: S,
    transform: Transform<T, R, E>,
    options: ParallelOptions<R, E>,
) -> Result<PipelineHandle<R, E>, PipelineError<E>>
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + Sync + 'static,
{
    options.validate()?;
    let policy = RetryPolicy::from_options(&options);
    let ParallelOptions {
        name,
        max_parallelism,
        channel_capacity,
        ordered_output,
        error_mode,
        adaptive,
        cancellation,
        hooks,
        listeners,
        ..
    } = options;

    let emitter = Emitter::new(name.clone(), listeners.clone());
    let external_token = cancellation.unwrap_or_default();
    let engine_token = external_token.child_token();
    let shutdown = engine_token.clone();

    let input = Arc::new(BoundedQueue::new(channel_capacity));
    let output = Arc::new(BoundedQueue::new(channel_capacity));
    let aggregator = Arc::new(Aggregator::new());

    let controller = adaptive
        .as_ref()
        .map(|adaptive| AdaptiveController::new(adaptive, name.clone(), listeners));
    let sampler_stop = CancellationToken::new();
    let sampler = controller
        .as_ref()
        .map(|controller| Arc::clone(controller).spawn_sampler(sampler_stop.clone()));

    let producer = tokio::spawn(run_producer(
        source,
        Arc::clone(&input),
        engine_token.clone(),
        Arc::clone(&aggregator),
    ));

    let ctx = Arc::new(WorkerContext {
        emitter: emitter.clone(),
        input,
        output: Arc::clone(&output),
        transform,
        policy,
        hooks,
        error_mode,
        engine_token,
        controller,
        aggregator: Arc::clone(&aggregator),
        in_flight: AtomicUsize::new(0),
        completions: AtomicU64::new(0),
        max_parallelism,
    });

    let mut workers = JoinSet::new();
    for worker_index in 0..max_parallelism {
        workers.spawn(run_worker(worker_index, Arc::clone(&ctx)));
    }

    let (terminal_tx, terminal_rx) = oneshot::channel();
    let coordinator_output = Arc::clone(&output);
    tokio::spawn(async move {
        let _ = producer.await;
        while workers.join_next().await.is_some() {}

        sampler_stop.cancel();
        if let Some(handle) = sampler {
            let _ = handle.await;
        }

        coordinator_output.close();
        ctx.hooks.drain().await;
        emitter.emit(|pipeline, timestamp| PipelineEvent::DrainCompleted {
            pipeline,
            timestamp,
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(pipeline = %emitter.name(), "pipeline drained");

        #[cfg(feature = "metrics")]
        metrics::counter!("rivulet_drain_events_total", "pipeline" => emitter.name().to_string())
            .increment(1);

        let terminal = terminal_signal(&external_token, &aggregator);
        let _ = terminal_tx.send(terminal);
    });

    Ok(PipelineHandle {
        output,
        terminal: terminal_rx,
        ordered: ordered_output,
        shutdown,
    })
}

async fn run_producer<S, T, E>(
    source: S,
    input: Arc<BoundedQueue<(u64, T)>>,
    engine_token: CancellationToken,
    aggregator: Arc<Aggregator<E>>,
) where
    S: Stream<Item = Result<T, E>>,
{
    tokio::pin!(source);
    let mut index: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = engine_token.cancelled() => break,
            next = source.next() => next,
        };
        match next {
            Some(Ok(value)) => {
                let written = tokio::select! {
                    biased;
                    _ = engine_token.cancelled() => false,
                    result = input.write((index, value)) => result.is_ok(),
                };
                if !written {
                    break;
                }
                index += 1;
            }
            Some(Err(error)) => {
                aggregator.record_source_error(error);
                engine_token.cancel();
                break;
            }
            None => break,
        }
    }
    input.close();
}

/// Terminal precedence: external cancellation, then the fatal source
/// error, then per-item failures. A lone fail-fast error surfaces
/// directly; anything else aggregates.
fn terminal_signal<E>(
    external_token: &CancellationToken,
    aggregator: &Aggregator<E>,
) -> Option<PipelineError<E>> {
    if external_token.is_cancelled() {
        return Some(PipelineError::Cancelled);
    }
    let mut state = aggregator.take();
    if let Some(error) = state.source_error {
        return Some(PipelineError::Source(error));
    }
    if state.errors.is_empty() {
        return None;
    }
    if state.fail_fast && state.errors.len() == 1 {
        let error = state.errors.remove(0);
        return Some(PipelineError::Item(error));
    }
    Some(PipelineError::Aggregate(state.errors))
}

impl<R, E> PipelineHandle<R, E>
where
    R: Send + 'static,
    E: Send + 'static,
{
    /// Drains the whole run into a `Vec`, surfacing the terminal error.
    pub(crate) async fn collect(self) -> Result<Vec<R>, PipelineError<E>> {
        let mut consumer = Consumer::new(self);
        let mut collected = Vec::new();
        while let Some(next) = consumer.next().await {
            collected.push(next?);
        }
        Ok(collected)
    }

    /// Drives the run to completion, discarding outputs.
    pub(crate) async fn run_to_completion(self) -> Result<(), PipelineError<E>> {
        let mut consumer = Consumer::new(self);
        while let Some(next) = consumer.next().await {
            next?;
        }
        Ok(())
    }

    pub(crate) fn into_stream(self) -> ParallelStream<R, E> {
        let inner = futures::stream::unfold(Consumer::new(self), |mut consumer| async move {
            consumer.next().await.map(|item| (item, consumer))
        })
        .boxed();
        ParallelStream { inner }
    }
}

struct Consumer<R, E> {
    output: Arc<BoundedQueue<(u64, R)>>,
    reorder: Option<ReorderBuffer<R>>,
    ready: VecDeque<R>,
    terminal: Option<oneshot::Receiver<Option<PipelineError<E>>>>,
    output_done: bool,
    shutdown: CancellationToken,
}

impl<R, E> Drop for Consumer<R, E> {
    fn drop(&mut self) {
        // An abandoned consumer must not leave workers parked on a full
        // output queue; after a completed run this is a no-op.
        self.shutdown.cancel();
    }
}

impl<R, E> Consumer<R, E> {
    fn new(handle: PipelineHandle<R, E>) -> Self {
        Self {
            output: handle.output,
            reorder: handle.ordered.then(ReorderBuffer::new),
            ready: VecDeque::new(),
            terminal: Some(handle.terminal),
            output_done: false,
            shutdown: handle.shutdown,
        }
    }

    /// Yields the next output, then the terminal error if there is one,
    /// then `None` forever.
    async fn next(&mut self) -> Option<Result<R, PipelineError<E>>> {
        loop {
            if let Some(value) = self.ready.pop_front() {
                return Some(Ok(value));
            }
            if self.output_done {
                let receiver = self.terminal.take()?;
                return match receiver.await {
                    Ok(Some(error)) => Some(Err(error)),
                    Ok(None) => None,
                    // The coordinator never drops the sender on a live
                    // runtime; losing it means the run was torn down.
                    Err(_) => Some(Err(PipelineError::Cancelled)),
                };
            }
            match self.output.read().await {
                Some((index, value)) => match &mut self.reorder {
                    None => return Some(Ok(value)),
                    Some(buffer) => self.ready.extend(buffer.push(index, value)),
                },
                None => {
                    self.output_done = true;
                    if let Some(buffer) = self.reorder.take() {
                        self.ready.extend(buffer.finish());
                    }
                }
            }
        }
    }
}

/// Lazy output sequence of a pipeline run.
///
/// Yields each transformed item as `Ok`, in completion order (or source
/// order with `ordered_output`), followed by at most one terminal `Err`.
/// Created by [`map_parallel_stream`](crate::map_parallel_stream).
pub struct ParallelStream<R, E> {
    inner: BoxStream<'static, Result<R, PipelineError<E>>>,
}

impl<R, E> Stream for ParallelStream<R, E> {
    type Item = Result<R, PipelineError<E>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<R, E> fmt::Debug for ParallelStream<R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelStream").finish_non_exhaustive()
    }
}
