//! Events emitted by the pipeline.

use std::time::{Duration, Instant};

use rivulet_core::events::{EngineEvent, EventListeners};

/// Everything the engine reports about a run.
///
/// Every variant carries the pipeline name (set through
/// [`ParallelOptions::name`](crate::ParallelOptions::name)) and the instant
/// the event occurred.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A worker picked up an item.
    ItemStarted {
        pipeline: String,
        timestamp: Instant,
        index: u64,
    },
    /// An item committed a success or fallback value to the output.
    ItemCompleted {
        pipeline: String,
        timestamp: Instant,
        index: u64,
    },
    /// A retry was scheduled after a transient failure.
    RetryScheduled {
        pipeline: String,
        timestamp: Instant,
        index: u64,
        /// The retry about to run (1 = first retry).
        attempt: u32,
        /// Backoff delay before the retry.
        delay: Duration,
    },
    /// An item exhausted its attempts without a fallback.
    ItemFailed {
        pipeline: String,
        timestamp: Instant,
        index: u64,
        attempts: u32,
    },
    /// A fallback value was emitted in place of a failure.
    FallbackApplied {
        pipeline: String,
        timestamp: Instant,
        index: u64,
        attempts: u32,
    },
    /// A failed item was dropped (best-effort mode without an error hook).
    ItemDropped {
        pipeline: String,
        timestamp: Instant,
        index: u64,
    },
    /// The pool is saturated while input keeps queueing up.
    ThrottleDetected {
        pipeline: String,
        timestamp: Instant,
        in_flight: usize,
    },
    /// The adaptive controller moved the concurrency limit.
    ConcurrencyChanged {
        pipeline: String,
        timestamp: Instant,
        previous: usize,
        current: usize,
    },
    /// All workers quiesced and the output queue closed.
    DrainCompleted {
        pipeline: String,
        timestamp: Instant,
    },
}

impl EngineEvent for PipelineEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::ItemStarted { .. } => "item_started",
            PipelineEvent::ItemCompleted { .. } => "item_completed",
            PipelineEvent::RetryScheduled { .. } => "retry_scheduled",
            PipelineEvent::ItemFailed { .. } => "item_failed",
            PipelineEvent::FallbackApplied { .. } => "fallback_applied",
            PipelineEvent::ItemDropped { .. } => "item_dropped",
            PipelineEvent::ThrottleDetected { .. } => "throttle_detected",
            PipelineEvent::ConcurrencyChanged { .. } => "concurrency_changed",
            PipelineEvent::DrainCompleted { .. } => "drain_completed",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            PipelineEvent::ItemStarted { timestamp, .. }
            | PipelineEvent::ItemCompleted { timestamp, .. }
            | PipelineEvent::RetryScheduled { timestamp, .. }
            | PipelineEvent::ItemFailed { timestamp, .. }
            | PipelineEvent::FallbackApplied { timestamp, .. }
            | PipelineEvent::ItemDropped { timestamp, .. }
            | PipelineEvent::ThrottleDetected { timestamp, .. }
            | PipelineEvent::ConcurrencyChanged { timestamp, .. }
            | PipelineEvent::DrainCompleted { timestamp, .. } => *timestamp,
        }
    }

    fn pipeline_name(&self) -> &str {
        match self {
            PipelineEvent::ItemStarted { pipeline, .. }
            | PipelineEvent::ItemCompleted { pipeline, .. }
            | PipelineEvent::RetryScheduled { pipeline, .. }
            | PipelineEvent::ItemFailed { pipeline, .. }
            | PipelineEvent::FallbackApplied { pipeline, .. }
            | PipelineEvent::ItemDropped { pipeline, .. }
            | PipelineEvent::ThrottleDetected { pipeline, .. }
            | PipelineEvent::ConcurrencyChanged { pipeline, .. }
            | PipelineEvent::DrainCompleted { pipeline, .. } => pipeline,
        }
    }
}

/// Stamps events with the pipeline name and emission time.
///
/// Skips the allocation entirely when nobody is listening.
#[derive(Clone)]
pub(crate) struct Emitter {
    pipeline: String,
    listeners: EventListeners<PipelineEvent>,
}

impl Emitter {
    pub(crate) fn new(pipeline: String, listeners: EventListeners<PipelineEvent>) -> Self {
        Self {
            pipeline,
            listeners,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.pipeline
    }

    pub(crate) fn emit(&self, build: impl FnOnce(String, Instant) -> PipelineEvent) {
        if self.listeners.is_empty() {
            return;
        }
        let event = build(self.pipeline.clone(), Instant::now());
        self.listeners.emit(&event);
    }
}
