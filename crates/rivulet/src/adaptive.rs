//! Adaptive concurrency control.
//!
//! The controller owns a permit pool sized by a feedback loop: a background
//! sampler aggregates per-item latency and success samples over fixed
//! windows and widens or narrows the pool inside `[min, max]`. Workers gate
//! on [`AdaptiveController::acquire`] before each item and report back
//! through [`AdaptiveController::release`].
//!
//! Narrowing never aborts running work. The semaphore cannot take permits
//! back while they are out, so a shrink first swallows whatever permits are
//! idle and books the rest as debt; releases repay debt before returning
//! permits to the pool.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rivulet_core::events::EventListeners;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigError;
use crate::events::PipelineEvent;

/// How the limit widens when a sampling window looks healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncreaseStrategy {
    /// Additive: `+1` per window.
    #[default]
    Aimd,
    /// `+max(2, 25% of current)` per window.
    Aggressive,
    /// `+1` every other window.
    Gradual,
}

/// How the limit narrows when a window shows failures or slow latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecreaseStrategy {
    /// Multiplicative: halve (floor).
    #[default]
    Aimd,
    /// Halve.
    Aggressive,
    /// `× 0.75` (ceil).
    Gradual,
}

impl IncreaseStrategy {
    fn apply(self, current: usize, gradual_gate: &mut bool) -> usize {
        match self {
            IncreaseStrategy::Aimd => current.saturating_add(1),
            IncreaseStrategy::Aggressive => current.saturating_add((current / 4).max(2)),
            IncreaseStrategy::Gradual => {
                *gradual_gate = !*gradual_gate;
                if *gradual_gate {
                    current.saturating_add(1)
                } else {
                    current
                }
            }
        }
    }
}

impl DecreaseStrategy {
    fn apply(self, current: usize) -> usize {
        match self {
            DecreaseStrategy::Aimd | DecreaseStrategy::Aggressive => current / 2,
            DecreaseStrategy::Gradual => (current as f64 * 0.75).ceil() as usize,
        }
    }
}

/// Configuration for adaptive concurrency.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rivulet::AdaptiveOptions;
///
/// let adaptive = AdaptiveOptions::new()
///     .min_concurrency(1)
///     .max_concurrency(32)
///     .initial_concurrency(4)
///     .sample_interval(Duration::from_millis(250))
///     .target_latency(Duration::from_millis(50))
///     .min_success_rate(0.9);
/// ```
#[derive(Clone)]
pub struct AdaptiveOptions {
    pub(crate) min_concurrency: usize,
    pub(crate) max_concurrency: usize,
    pub(crate) initial_concurrency: Option<usize>,
    pub(crate) sample_interval: Duration,
    pub(crate) target_latency: Option<Duration>,
    pub(crate) min_success_rate: f64,
    pub(crate) increase_strategy: IncreaseStrategy,
    pub(crate) decrease_strategy: DecreaseStrategy,
    pub(crate) on_change: Option<Arc<dyn Fn(usize, usize) + Send + Sync>>,
}

impl Default for AdaptiveOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveOptions {
    /// Creates options with `min = 1`, `max =` available CPUs, a 100ms
    /// sampling window, and AIMD stepping.
    pub fn new() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            initial_concurrency: None,
            sample_interval: Duration::from_millis(100),
            target_latency: None,
            min_success_rate: 1.0,
            increase_strategy: IncreaseStrategy::default(),
            decrease_strategy: DecreaseStrategy::default(),
            on_change: None,
        }
    }

    /// Floor for the concurrency limit. Default 1.
    pub fn min_concurrency(mut self, min: usize) -> Self {
        self.min_concurrency = min;
        self
    }

    /// Ceiling for the concurrency limit.
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Starting limit. Defaults to `min_concurrency`.
    pub fn initial_concurrency(mut self, initial: usize) -> Self {
        self.initial_concurrency = Some(initial);
        self
    }

    /// Width of one sampling window. Default 100ms.
    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Average latency above which a window counts as congested.
    pub fn target_latency(mut self, target: Duration) -> Self {
        self.target_latency = Some(target);
        self
    }

    /// Success rate below which a window forces a decrease. Default 1.0.
    pub fn min_success_rate(mut self, rate: f64) -> Self {
        self.min_success_rate = rate;
        self
    }

    /// Stepping used on healthy windows. Default AIMD (+1).
    pub fn increase_strategy(mut self, strategy: IncreaseStrategy) -> Self {
        self.increase_strategy = strategy;
        self
    }

    /// Stepping used on congested windows. Default AIMD (halve).
    pub fn decrease_strategy(mut self, strategy: DecreaseStrategy) -> Self {
        self.decrease_strategy = strategy;
        self
    }

    /// Called with `(old, new)` whenever the limit moves. Best-effort.
    pub fn on_concurrency_change<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(f));
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.min_concurrency == 0 {
            return Err(ConfigError::ZeroMinConcurrency);
        }
        if self.max_concurrency < self.min_concurrency {
            return Err(ConfigError::ConcurrencyRange {
                min: self.min_concurrency,
                max: self.max_concurrency,
            });
        }
        if let Some(initial) = self.initial_concurrency {
            if initial < self.min_concurrency || initial > self.max_concurrency {
                return Err(ConfigError::InitialConcurrencyOutOfRange {
                    initial,
                    min: self.min_concurrency,
                    max: self.max_concurrency,
                });
            }
        }
        if self.sample_interval.is_zero() {
            return Err(ConfigError::ZeroSampleInterval);
        }
        if self.target_latency.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroTargetLatency);
        }
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err(ConfigError::SuccessRateOutOfRange(self.min_success_rate));
        }
        Ok(())
    }

    pub(crate) fn initial(&self) -> usize {
        self.initial_concurrency.unwrap_or(self.min_concurrency)
    }
}

impl fmt::Debug for AdaptiveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveOptions")
            .field("min_concurrency", &self.min_concurrency)
            .field("max_concurrency", &self.max_concurrency)
            .field("initial_concurrency", &self.initial_concurrency)
            .field("sample_interval", &self.sample_interval)
            .field("target_latency", &self.target_latency)
            .field("min_success_rate", &self.min_success_rate)
            .field("increase_strategy", &self.increase_strategy)
            .field("decrease_strategy", &self.decrease_strategy)
            .finish()
    }
}

#[derive(Default)]
struct LimitState {
    current: usize,
    /// Permits swallowed lazily after a shrink; releases repay this before
    /// returning permits to the pool.
    debt: usize,
}

#[derive(Default)]
struct SampleWindow {
    total_latency: Duration,
    successes: u64,
    failures: u64,
}

pub(crate) struct AdaptiveController {
    name: String,
    listeners: EventListeners<PipelineEvent>,
    semaphore: Semaphore,
    limits: Mutex<LimitState>,
    window: Mutex<SampleWindow>,
    min: usize,
    max: usize,
    sample_interval: Duration,
    target_latency: Option<Duration>,
    min_success_rate: f64,
    increase_strategy: IncreaseStrategy,
    decrease_strategy: DecreaseStrategy,
    on_change: Option<Arc<dyn Fn(usize, usize) + Send + Sync>>,
}

impl AdaptiveController {
    pub(crate) fn new(
        options: &AdaptiveOptions,
        name: String,
        listeners: EventListeners<PipelineEvent>,
    ) -> Arc<Self> {
        let initial = options.initial();
        Arc::new(Self {
            name,
            listeners,
            semaphore: Semaphore::new(initial),
            limits: Mutex::new(LimitState {
                current: initial,
                debt: 0,
            }),
            window: Mutex::new(SampleWindow::default()),
            min: options.min_concurrency,
            max: options.max_concurrency,
            sample_interval: options.sample_interval,
            target_latency: options.target_latency,
            min_success_rate: options.min_success_rate,
            increase_strategy: options.increase_strategy,
            decrease_strategy: options.decrease_strategy,
            on_change: options.on_change.clone(),
        })
    }

    /// Waits for a permit. Returns `false` only if the pool was torn down.
    pub(crate) async fn acquire(&self) -> bool {
        match self.semaphore.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Returns a permit and records one sample for the current window.
    pub(crate) fn release(&self, latency: Duration, success: bool) {
        let repaid = {
            let mut limits = self.limits.lock().unwrap();
            if limits.debt > 0 {
                limits.debt -= 1;
                true
            } else {
                false
            }
        };
        if !repaid {
            self.semaphore.add_permits(1);
        }

        let mut window = self.window.lock().unwrap();
        window.total_latency += latency;
        if success {
            window.successes += 1;
        } else {
            window.failures += 1;
        }
    }

    pub(crate) fn current_limit(&self) -> usize {
        self.limits.lock().unwrap().current
    }

    /// Starts the window sampler. The task exits when `stop` is cancelled.
    pub(crate) fn spawn_sampler(self: Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut gradual_gate = false;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => self.sample_tick(&mut gradual_gate),
                }
            }
        })
    }

    fn sample_tick(&self, gradual_gate: &mut bool) {
        let window = std::mem::take(&mut *self.window.lock().unwrap());
        let samples = window.successes + window.failures;
        if samples == 0 {
            return;
        }

        let success_rate = window.successes as f64 / samples as f64;
        let avg_latency = window.total_latency / samples.min(u32::MAX as u64) as u32;
        let congested = success_rate < self.min_success_rate
            || self
                .target_latency
                .is_some_and(|target| avg_latency > target);

        let current = self.current_limit();
        let next = if congested {
            self.decrease_strategy.apply(current)
        } else {
            self.increase_strategy.apply(current, gradual_gate)
        };
        let next = next.clamp(self.min, self.max);
        if next != current {
            self.apply_limit(current, next);
        }
    }

    fn apply_limit(&self, old: usize, new: usize) {
        {
            let mut limits = self.limits.lock().unwrap();
            if new > old {
                let mut grow = new - old;
                let repay = grow.min(limits.debt);
                limits.debt -= repay;
                grow -= repay;
                if grow > 0 {
                    self.semaphore.add_permits(grow);
                }
            } else {
                let mut shrink = old - new;
                while shrink > 0 {
                    match self.semaphore.try_acquire() {
                        Ok(permit) => {
                            permit.forget();
                            shrink -= 1;
                        }
                        Err(_) => break,
                    }
                }
                limits.debt += shrink;
            }
            limits.current = new;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            pipeline = %self.name,
            previous = old,
            current = new,
            "concurrency limit adjusted"
        );

        #[cfg(feature = "metrics")]
        metrics::gauge!("rivulet_concurrency_limit", "pipeline" => self.name.clone())
            .set(new as f64);

        self.listeners.emit(&PipelineEvent::ConcurrencyChanged {
            pipeline: self.name.clone(),
            timestamp: Instant::now(),
            previous: old,
            current: new,
        });

        if let Some(hook) = &self.on_change {
            let _ = catch_unwind(AssertUnwindSafe(|| hook(old, new)));
        }
    }
}

impl fmt::Debug for AdaptiveController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limits = self.limits.lock().unwrap();
        f.debug_struct("AdaptiveController")
            .field("current", &limits.current)
            .field("debt", &limits.debt)
            .field("min", &self.min)
            .field("max", &self.max)
            .finish()
    }
}
