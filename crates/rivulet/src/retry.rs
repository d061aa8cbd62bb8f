//! Per-item attempt loop: timeout, classification, backoff, fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffStrategy;
use crate::config::ParallelOptions;
use crate::error::{ItemError, ItemFailure};
use crate::events::{Emitter, PipelineEvent};
use crate::hooks::Hooks;

/// Type-erased user transform.
pub(crate) type Transform<T, R, E> =
    Arc<dyn Fn(T, CancellationToken) -> BoxFuture<'static, Result<R, E>> + Send + Sync>;

/// Retry/timeout policy distilled from the options.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) max_retries: u32,
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) strategy: BackoffStrategy,
    pub(crate) per_item_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub(crate) fn from_options<R, E>(options: &ParallelOptions<R, E>) -> Self {
        Self {
            max_retries: options.max_retries,
            base_delay: options.base_delay,
            max_delay: options.max_delay,
            strategy: options.backoff_strategy,
            per_item_timeout: options.per_item_timeout,
        }
    }
}

/// Terminal state of one item.
pub(crate) enum Outcome<R, E> {
    Success(R),
    Fallback(R),
    Failure(ItemError<E>),
    Cancelled,
}

/// What the worker needs back from the attempt loop.
pub(crate) struct ItemReport<R, E> {
    pub(crate) outcome: Outcome<R, E>,
    /// Latency of the most recent attempt; the adaptive controller's
    /// sample.
    pub(crate) last_latency: Duration,
}

enum AttemptResult<R, E> {
    Ok(R),
    Failed(E),
    TimedOut,
}

/// Runs one item to its terminal outcome.
///
/// Engine cancellation propagates immediately on any failed attempt and
/// aborts backoff sleeps; a successful attempt still commits its result
/// even if cancellation arrived while it ran. Timeouts are transient by
/// definition; transform errors consult the classifier.
pub(crate) async fn run_item<T, R, E>(
    index: u64,
    value: T,
    transform: &Transform<T, R, E>,
    policy: &RetryPolicy,
    hooks: &Hooks<R, E>,
    engine_token: &CancellationToken,
    emitter: &Emitter,
) -> ItemReport<R, E>
where
    T: Clone,
{
    let mut attempt: u32 = 1;
    loop {
        let started = Instant::now();
        let result = run_attempt(value.clone(), transform, policy, engine_token).await;
        let last_latency = started.elapsed();

        let failure = match result {
            AttemptResult::Ok(output) => {
                return ItemReport {
                    outcome: Outcome::Success(output),
                    last_latency,
                };
            }
            AttemptResult::Failed(error) => {
                if engine_token.is_cancelled() {
                    return ItemReport {
                        outcome: Outcome::Cancelled,
                        last_latency,
                    };
                }
                ItemFailure::Transform(error)
            }
            AttemptResult::TimedOut => {
                if engine_token.is_cancelled() {
                    return ItemReport {
                        outcome: Outcome::Cancelled,
                        last_latency,
                    };
                }
                ItemFailure::Timeout(policy.per_item_timeout.unwrap_or_default())
            }
        };

        let transient = match &failure {
            ItemFailure::Timeout(_) => true,
            ItemFailure::Transform(error) => hooks.transient(error),
        };

        if transient && attempt <= policy.max_retries {
            let delay = policy
                .strategy
                .delay(policy.base_delay, attempt, policy.max_delay);

            hooks.retry(index, attempt, &failure).await;
            emitter.emit(|pipeline, timestamp| PipelineEvent::RetryScheduled {
                pipeline,
                timestamp,
                index,
                attempt,
                delay,
            });

            #[cfg(feature = "tracing")]
            tracing::debug!(
                pipeline = %emitter.name(),
                index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after delay"
            );

            #[cfg(feature = "metrics")]
            metrics::counter!("rivulet_retries_total", "pipeline" => emitter.name().to_string())
                .increment(1);

            tokio::select! {
                _ = engine_token.cancelled() => {
                    return ItemReport {
                        outcome: Outcome::Cancelled,
                        last_latency,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
            continue;
        }

        if let Some(substitute) = hooks.fallback(index, &failure) {
            emitter.emit(|pipeline, timestamp| PipelineEvent::FallbackApplied {
                pipeline,
                timestamp,
                index,
                attempts: attempt,
            });
            return ItemReport {
                outcome: Outcome::Fallback(substitute),
                last_latency,
            };
        }

        return ItemReport {
            outcome: Outcome::Failure(ItemError {
                index,
                attempts: attempt,
                failure,
            }),
            last_latency,
        };
    }
}

async fn run_attempt<T, R, E>(
    value: T,
    transform: &Transform<T, R, E>,
    policy: &RetryPolicy,
    engine_token: &CancellationToken,
) -> AttemptResult<R, E> {
    let attempt_token = engine_token.child_token();
    let fut = transform(value, attempt_token.clone());
    match policy.per_item_timeout {
        Some(budget) => match tokio::time::timeout(budget, fut).await {
            Ok(Ok(output)) => AttemptResult::Ok(output),
            Ok(Err(error)) => AttemptResult::Failed(error),
            Err(_) => {
                // The future is already dropped; the cancel lets work the
                // transform handed off elsewhere observe the abort.
                attempt_token.cancel();
                AttemptResult::TimedOut
            }
        },
        None => match fut.await {
            Ok(output) => AttemptResult::Ok(output),
            Err(error) => AttemptResult::Failed(error),
        },
    }
}
