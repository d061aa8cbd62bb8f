//! Pipeline options and validation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rivulet_core::events::{EventListener, EventListeners};
use tokio_util::sync::CancellationToken;

use crate::adaptive::AdaptiveOptions;
use crate::backoff::BackoffStrategy;
use crate::error::ItemFailure;
use crate::events::PipelineEvent;
use crate::hooks::Hooks;
use crate::metrics::PipelineMetrics;

/// Rejected option values, raised before any work starts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("`max_parallelism` must be at least 1")]
    ZeroParallelism,
    #[error("`channel_capacity` must be at least 1")]
    ZeroChannelCapacity,
    #[error("`per_item_timeout` must be positive")]
    ZeroItemTimeout,
    #[error("`min_concurrency` must be at least 1")]
    ZeroMinConcurrency,
    #[error("`max_concurrency` ({max}) must be at least `min_concurrency` ({min})")]
    ConcurrencyRange { min: usize, max: usize },
    #[error("`initial_concurrency` ({initial}) must lie within [{min}, {max}]")]
    InitialConcurrencyOutOfRange {
        initial: usize,
        min: usize,
        max: usize,
    },
    #[error("`sample_interval` must be positive")]
    ZeroSampleInterval,
    #[error("`target_latency` must be positive")]
    ZeroTargetLatency,
    #[error("`min_success_rate` ({0}) must lie within [0.0, 1.0]")]
    SuccessRateOutOfRange(f64),
}

/// How per-item failures affect the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Record the error, cancel the engine, surface the first failure.
    #[default]
    FailFast,
    /// Keep processing; surface every failure as one aggregate at the end.
    CollectAndContinue,
    /// Ask the `on_error` hook per failure: `true` collects, `false` fails
    /// fast. Without a hook, failed items are silently dropped.
    BestEffort,
}

/// Options for a pipeline run.
///
/// `R` is the transform's output type and `E` its error type; the input
/// type stays out of the options so one options value can drive transforms
/// over any input.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rivulet::{BackoffStrategy, ErrorMode, ParallelOptions};
///
/// #[derive(Debug)]
/// struct FetchError;
///
/// let options: ParallelOptions<String, FetchError> = ParallelOptions::new()
///     .name("fetch")
///     .max_parallelism(8)
///     .max_retries(3)
///     .base_delay(Duration::from_millis(50))
///     .backoff_strategy(BackoffStrategy::ExponentialJitter)
///     .is_transient(|_err: &FetchError| true)
///     .per_item_timeout(Duration::from_secs(2))
///     .error_mode(ErrorMode::CollectAndContinue)
///     .ordered_output(true);
/// ```
pub struct ParallelOptions<R, E> {
    pub(crate) name: String,
    pub(crate) max_parallelism: usize,
    pub(crate) channel_capacity: usize,
    pub(crate) ordered_output: bool,
    pub(crate) error_mode: ErrorMode,
    pub(crate) per_item_timeout: Option<Duration>,
    pub(crate) max_retries: u32,
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) backoff_strategy: BackoffStrategy,
    pub(crate) adaptive: Option<AdaptiveOptions>,
    pub(crate) cancellation: Option<CancellationToken>,
    pub(crate) hooks: Hooks<R, E>,
    pub(crate) listeners: EventListeners<PipelineEvent>,
}

impl<R, E> Default for ParallelOptions<R, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, E> ParallelOptions<R, E> {
    /// Creates options with the defaults described per setter.
    pub fn new() -> Self {
        Self {
            name: "<unnamed>".to_string(),
            max_parallelism: default_parallelism(),
            channel_capacity: 1024,
            ordered_output: false,
            error_mode: ErrorMode::default(),
            per_item_timeout: None,
            max_retries: 0,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_strategy: BackoffStrategy::default(),
            adaptive: None,
            cancellation: None,
            hooks: Hooks::default(),
            listeners: EventListeners::new(),
        }
    }

    /// Sets the pipeline name used in events, logs, and metric labels.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Hard ceiling on concurrently running transforms.
    ///
    /// Defaults to the number of available CPUs. When adaptive concurrency
    /// is also configured, the controller gates *below* this ceiling.
    pub fn max_parallelism(mut self, n: usize) -> Self {
        self.max_parallelism = n;
        self
    }

    /// Bound for the input and output queues. Default 1024.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Yields outputs in source order. Default false (completion order).
    pub fn ordered_output(mut self, ordered: bool) -> Self {
        self.ordered_output = ordered;
        self
    }

    /// Failure routing. Default [`ErrorMode::FailFast`].
    pub fn error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    /// Cancels each individual attempt after this budget.
    pub fn per_item_timeout(mut self, timeout: Duration) -> Self {
        self.per_item_timeout = Some(timeout);
        self
    }

    /// Retries per item, excluding the first attempt. Default 0.
    ///
    /// Transform errors only retry when [`is_transient`](Self::is_transient)
    /// says so; timeouts always count as transient.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Seed delay for the backoff strategy. Default 100ms.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Clamp applied to every backoff delay. Default 30s.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay progression between attempts. Default exponential.
    pub fn backoff_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Enables adaptive concurrency control.
    pub fn adaptive(mut self, options: AdaptiveOptions) -> Self {
        self.adaptive = Some(options);
        self
    }

    /// External cancellation token; cancelling it stops the run and
    /// surfaces [`PipelineError::Cancelled`](crate::PipelineError::Cancelled).
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Predicate deciding whether a transform error is worth retrying.
    ///
    /// Absent means transform errors never retry.
    pub fn is_transient<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.hooks.is_transient = Some(Arc::new(predicate));
        self
    }

    /// Substitute value emitted when an item's attempts are exhausted.
    pub fn on_fallback<F>(mut self, f: F) -> Self
    where
        F: Fn(u64, &ItemFailure<E>) -> R + Send + Sync + 'static,
    {
        self.hooks.on_fallback = Some(Arc::new(f));
        self
    }

    /// Called when a worker picks up an item. Best-effort.
    pub fn on_start_item<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.hooks.on_start_item = Some(Arc::new(f));
        self
    }

    /// Called after an item's output is committed. Best-effort.
    pub fn on_complete_item<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.hooks.on_complete_item = Some(Arc::new(f));
        self
    }

    /// Called with `(index, retry_number, failure)` before each backoff
    /// sleep. Best-effort.
    pub fn on_retry<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u64, u32, &ItemFailure<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.on_retry = Some(Arc::new(move |index, attempt, failure| {
            Box::pin(f(index, attempt, failure))
        }));
        self
    }

    /// Decision hook for [`ErrorMode::BestEffort`]: return `true` to collect
    /// the failure and continue, `false` to stop the pipeline.
    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u64, &ItemFailure<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.hooks.on_error = Some(Arc::new(move |index, failure| Box::pin(f(index, failure))));
        self
    }

    /// Called with the in-flight count when the saturated pool observes a
    /// backed-up input queue. Best-effort.
    pub fn on_throttle<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.on_throttle = Some(Arc::new(move |in_flight| Box::pin(f(in_flight))));
        self
    }

    /// Called once after all workers quiesce and the output closes.
    /// Best-effort.
    pub fn on_drain<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.on_drain = Some(Arc::new(move || Box::pin(f())));
        self
    }

    /// Registers an event listener.
    pub fn on_event<L>(mut self, listener: L) -> Self
    where
        L: EventListener<PipelineEvent> + 'static,
    {
        self.listeners.add(listener);
        self
    }

    /// Attaches a shared counter sink.
    pub fn metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.listeners.add_shared(metrics);
        self
    }

    /// Checks every option, naming the first offender.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        if self.per_item_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroItemTimeout);
        }
        if let Some(adaptive) = &self.adaptive {
            adaptive.validate()?;
        }
        Ok(())
    }
}

impl<R, E> std::fmt::Debug for ParallelOptions<R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelOptions")
            .field("name", &self.name)
            .field("max_parallelism", &self.max_parallelism)
            .field("channel_capacity", &self.channel_capacity)
            .field("ordered_output", &self.ordered_output)
            .field("error_mode", &self.error_mode)
            .field("per_item_timeout", &self.per_item_timeout)
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("backoff_strategy", &self.backoff_strategy)
            .field("adaptive", &self.adaptive)
            .finish()
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
