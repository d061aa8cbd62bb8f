//! The cooperative worker loop.
//!
//! Each worker pulls `(index, value)` records from the input queue, runs
//! the retry executor, and routes the outcome: successes and fallbacks go
//! to the output queue, failures go to the error-mode policy, cancellation
//! ends the loop. Workers share one context object; all per-item state
//! stays on the worker's own stack.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rivulet_core::queue::BoundedQueue;
use tokio_util::sync::CancellationToken;

use crate::adaptive::AdaptiveController;
use crate::config::ErrorMode;
use crate::error::ItemError;
use crate::events::{Emitter, PipelineEvent};
use crate::hooks::Hooks;
use crate::pipeline::Aggregator;
use crate::retry::{self, Outcome, RetryPolicy, Transform};

/// How many pool-wide completions pass between throttle checks.
const THROTTLE_CHECK_INTERVAL: u64 = 16;

/// Shared state for every worker of one pipeline.
pub(crate) struct WorkerContext<T, R, E> {
    pub(crate) emitter: Emitter,
    pub(crate) input: Arc<BoundedQueue<(u64, T)>>,
    pub(crate) output: Arc<BoundedQueue<(u64, R)>>,
    pub(crate) transform: Transform<T, R, E>,
    pub(crate) policy: RetryPolicy,
    pub(crate) hooks: Hooks<R, E>,
    pub(crate) error_mode: ErrorMode,
    pub(crate) engine_token: CancellationToken,
    pub(crate) controller: Option<Arc<AdaptiveController>>,
    pub(crate) aggregator: Arc<Aggregator<E>>,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) completions: AtomicU64,
    pub(crate) max_parallelism: usize,
}

impl<T, R, E> WorkerContext<T, R, E> {
    /// Concurrency the pool is currently allowed: the adaptive limit when
    /// configured, capped by the worker count either way.
    fn effective_limit(&self) -> usize {
        self.controller
            .as_ref()
            .map(|controller| controller.current_limit())
            .unwrap_or(self.max_parallelism)
            .min(self.max_parallelism)
    }
}

pub(crate) async fn run_worker<T, R, E>(worker_index: usize, ctx: Arc<WorkerContext<T, R, E>>)
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    loop {
        let record = tokio::select! {
            biased;
            _ = ctx.engine_token.cancelled() => None,
            record = ctx.input.read() => record,
        };
        let Some((index, value)) = record else { break };

        ctx.hooks.start_item(index);
        ctx.emitter
            .emit(|pipeline, timestamp| PipelineEvent::ItemStarted {
                pipeline,
                timestamp,
                index,
            });

        #[cfg(feature = "tracing")]
        tracing::trace!(pipeline = %ctx.emitter.name(), worker_index, index, "item started");

        #[cfg(feature = "metrics")]
        metrics::counter!("rivulet_items_started_total", "pipeline" => ctx.emitter.name().to_string())
            .increment(1);

        if let Some(controller) = &ctx.controller {
            let acquired = tokio::select! {
                biased;
                _ = ctx.engine_token.cancelled() => false,
                acquired = controller.acquire() => acquired,
            };
            if !acquired {
                break;
            }
        }
        ctx.in_flight.fetch_add(1, Ordering::SeqCst);

        let report = retry::run_item(
            index,
            value,
            &ctx.transform,
            &ctx.policy,
            &ctx.hooks,
            &ctx.engine_token,
            &ctx.emitter,
        )
        .await;

        if let Some(controller) = &ctx.controller {
            let success = matches!(report.outcome, Outcome::Success(_));
            controller.release(report.last_latency, success);
        }

        let keep_going = route_outcome(&ctx, index, report.outcome).await;
        ctx.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !keep_going {
            break;
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(worker_index, "worker finished");
    #[cfg(not(feature = "tracing"))]
    let _ = worker_index;
}

/// Routes one terminal outcome. Returns `false` when the worker should
/// stop.
async fn route_outcome<T, R, E>(
    ctx: &WorkerContext<T, R, E>,
    index: u64,
    outcome: Outcome<R, E>,
) -> bool {
    match outcome {
        Outcome::Success(value) | Outcome::Fallback(value) => {
            let written = tokio::select! {
                biased;
                _ = ctx.engine_token.cancelled() => false,
                result = ctx.output.write((index, value)) => result.is_ok(),
            };
            if !written {
                return false;
            }

            ctx.hooks.complete_item(index);
            ctx.emitter
                .emit(|pipeline, timestamp| PipelineEvent::ItemCompleted {
                    pipeline,
                    timestamp,
                    index,
                });

            #[cfg(feature = "metrics")]
            metrics::counter!("rivulet_items_completed_total", "pipeline" => ctx.emitter.name().to_string())
                .increment(1);

            maybe_throttle(ctx).await;
            true
        }
        Outcome::Failure(error) => route_failure(ctx, error).await,
        Outcome::Cancelled => false,
    }
}

async fn route_failure<T, R, E>(ctx: &WorkerContext<T, R, E>, error: ItemError<E>) -> bool {
    ctx.emitter
        .emit(|pipeline, timestamp| PipelineEvent::ItemFailed {
            pipeline,
            timestamp,
            index: error.index,
            attempts: error.attempts,
        });

    #[cfg(feature = "tracing")]
    tracing::warn!(
        pipeline = %ctx.emitter.name(),
        index = error.index,
        attempts = error.attempts,
        "item failed"
    );

    #[cfg(feature = "metrics")]
    metrics::counter!("rivulet_items_failed_total", "pipeline" => ctx.emitter.name().to_string())
        .increment(1);

    match ctx.error_mode {
        ErrorMode::FailFast => {
            ctx.aggregator.record_fail_fast(error);
            ctx.engine_token.cancel();
            false
        }
        ErrorMode::CollectAndContinue => {
            ctx.aggregator.record(error);
            true
        }
        ErrorMode::BestEffort => match ctx.hooks.error(error.index, &error.failure).await {
            Some(true) => {
                ctx.aggregator.record(error);
                true
            }
            Some(false) => {
                ctx.aggregator.record_fail_fast(error);
                ctx.engine_token.cancel();
                false
            }
            // No hook (or a panicking one): the item is dropped and the
            // output ends up shorter than the input.
            None => {
                ctx.emitter
                    .emit(|pipeline, timestamp| PipelineEvent::ItemDropped {
                        pipeline,
                        timestamp,
                        index: error.index,
                    });

                #[cfg(feature = "metrics")]
                metrics::counter!("rivulet_items_dropped_total", "pipeline" => ctx.emitter.name().to_string())
                    .increment(1);

                true
            }
        },
    }
}

/// Every [`THROTTLE_CHECK_INTERVAL`] completions, report saturation when
/// the pool is at its limit while input keeps queueing up.
async fn maybe_throttle<T, R, E>(ctx: &WorkerContext<T, R, E>) {
    let completed = ctx.completions.fetch_add(1, Ordering::Relaxed) + 1;
    if completed % THROTTLE_CHECK_INTERVAL != 0 {
        return;
    }

    let in_flight = ctx.in_flight.load(Ordering::SeqCst);
    if in_flight >= ctx.effective_limit() && !ctx.input.is_empty() {
        ctx.emitter
            .emit(|pipeline, timestamp| PipelineEvent::ThrottleDetected {
                pipeline,
                timestamp,
                in_flight,
            });

        #[cfg(feature = "metrics")]
        metrics::counter!("rivulet_throttle_events_total", "pipeline" => ctx.emitter.name().to_string())
            .increment(1);

        ctx.hooks.throttle(in_flight).await;
    }
}
