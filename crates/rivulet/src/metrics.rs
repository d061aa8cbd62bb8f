//! Counter sink for pipeline activity.

use std::sync::atomic::{AtomicU64, Ordering};

use rivulet_core::events::EventListener;

use crate::events::PipelineEvent;

/// Aggregate counters for one or more pipeline runs.
///
/// `PipelineMetrics` is the engine's metric sink: attach a shared instance
/// through [`ParallelOptions::metrics`](crate::ParallelOptions::metrics) and
/// read it during or after the run. All counters are plain atomics; reading
/// them never blocks a worker.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rivulet::PipelineMetrics;
///
/// let metrics = Arc::new(PipelineMetrics::default());
/// // options.metrics(Arc::clone(&metrics)) ...
/// assert_eq!(metrics.snapshot().items_completed, 0);
/// ```
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    items_started: AtomicU64,
    items_completed: AtomicU64,
    total_retries: AtomicU64,
    total_failures: AtomicU64,
    items_dropped: AtomicU64,
    throttle_events: AtomicU64,
    drain_events: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Items picked up by a worker.
    pub items_started: u64,
    /// Items that committed a success or fallback value.
    pub items_completed: u64,
    /// Retries scheduled across all items.
    pub total_retries: u64,
    /// Items that exhausted their attempts without a fallback.
    pub total_failures: u64,
    /// Failed items silently dropped in best-effort mode.
    pub items_dropped: u64,
    /// Times the saturated pool observed a backed-up input queue.
    pub throttle_events: u64,
    /// Completed drains (one per run).
    pub drain_events: u64,
}

impl PipelineMetrics {
    /// Items picked up by a worker.
    pub fn items_started(&self) -> u64 {
        self.items_started.load(Ordering::Relaxed)
    }

    /// Items that committed a success or fallback value.
    pub fn items_completed(&self) -> u64 {
        self.items_completed.load(Ordering::Relaxed)
    }

    /// Retries scheduled across all items.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Items that exhausted their attempts without a fallback.
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Failed items silently dropped in best-effort mode.
    pub fn items_dropped(&self) -> u64 {
        self.items_dropped.load(Ordering::Relaxed)
    }

    /// Times the saturated pool observed a backed-up input queue.
    pub fn throttle_events(&self) -> u64 {
        self.throttle_events.load(Ordering::Relaxed)
    }

    /// Completed drains (one per run).
    pub fn drain_events(&self) -> u64 {
        self.drain_events.load(Ordering::Relaxed)
    }

    /// Copies every counter at once.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_started: self.items_started(),
            items_completed: self.items_completed(),
            total_retries: self.total_retries(),
            total_failures: self.total_failures(),
            items_dropped: self.items_dropped(),
            throttle_events: self.throttle_events(),
            drain_events: self.drain_events(),
        }
    }
}

impl EventListener<PipelineEvent> for PipelineMetrics {
    fn on_event(&self, event: &PipelineEvent) {
        let counter = match event {
            PipelineEvent::ItemStarted { .. } => &self.items_started,
            PipelineEvent::ItemCompleted { .. } => &self.items_completed,
            PipelineEvent::RetryScheduled { .. } => &self.total_retries,
            PipelineEvent::ItemFailed { .. } => &self.total_failures,
            PipelineEvent::ItemDropped { .. } => &self.items_dropped,
            PipelineEvent::ThrottleDetected { .. } => &self.throttle_events,
            PipelineEvent::DrainCompleted { .. } => &self.drain_events,
            PipelineEvent::FallbackApplied { .. } | PipelineEvent::ConcurrencyChanged { .. } => {
                return
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
