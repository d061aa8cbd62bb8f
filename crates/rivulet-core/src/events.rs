//! Panic-isolated event listeners with strike-based muting.
//!
//! The engine reports what it is doing through events: items starting and
//! completing, retries being scheduled, concurrency changing. Listeners are
//! user code running on worker tasks, so a panicking listener must never
//! take the pipeline down, and a listener that panics on *every* event must
//! not keep burning a worker's time either. Each registered listener
//! carries a strike counter: a panic is caught and counted, and once the
//! counter reaches [`MAX_LISTENER_STRIKES`] the listener is muted for the
//! rest of the run. Strike state is shared across clones of the registry,
//! so every pipeline stage sees the same muting decision.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Panics a single listener may spend before it stops receiving events.
pub const MAX_LISTENER_STRIKES: u32 = 3;

/// Trait implemented by event types emitted by the engine.
pub trait EngineEvent: Send + Sync + fmt::Debug {
    /// A short static tag for the event (e.g. `"item_completed"`).
    fn event_type(&self) -> &'static str;

    /// When the event occurred.
    fn timestamp(&self) -> Instant;

    /// The configured name of the pipeline that emitted the event.
    fn pipeline_name(&self) -> &str;
}

/// Trait for observing engine events.
pub trait EventListener<E: EngineEvent>: Send + Sync {
    /// Called for every emitted event.
    fn on_event(&self, event: &E);
}

/// One listener plus its shared strike counter.
struct Registered<E: EngineEvent> {
    listener: Arc<dyn EventListener<E>>,
    strikes: AtomicU32,
}

impl<E: EngineEvent> Registered<E> {
    fn is_muted(&self) -> bool {
        self.strikes.load(Ordering::Relaxed) >= MAX_LISTENER_STRIKES
    }
}

/// A set of listeners sharing one event type.
///
/// Cloning the set is cheap and clones observe each other's strike state;
/// the registry built from the options is fanned out to every pipeline
/// stage this way.
pub struct EventListeners<E: EngineEvent> {
    entries: Vec<Arc<Registered<E>>>,
}

impl<E: EngineEvent> Clone for EventListeners<E> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<E: EngineEvent> EventListeners<E> {
    /// Creates an empty listener set.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers a listener.
    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.add_shared(Arc::new(listener));
    }

    /// Registers an already-shared listener without re-wrapping it.
    pub fn add_shared(&mut self, listener: Arc<dyn EventListener<E>>) {
        self.entries.push(Arc::new(Registered {
            listener,
            strikes: AtomicU32::new(0),
        }));
    }

    /// Delivers `event` to every listener that has not been muted.
    ///
    /// A panic inside a listener is caught, counted against that listener,
    /// and reported; the remaining listeners still see the event. The
    /// panic that crosses [`MAX_LISTENER_STRIKES`] mutes the listener for
    /// good.
    pub fn emit(&self, event: &E) {
        for entry in &self.entries {
            if entry.is_muted() {
                continue;
            }
            let delivery = catch_unwind(AssertUnwindSafe(|| entry.listener.on_event(event)));
            if let Err(payload) = delivery {
                let strikes = entry.strikes.fetch_add(1, Ordering::Relaxed) + 1;
                report_listener_panic(ListenerPanic {
                    pipeline: event.pipeline_name(),
                    event_type: event.event_type(),
                    strikes,
                    muted: strikes >= MAX_LISTENER_STRIKES,
                    message: panic_message(payload),
                });
            }
        }
    }

    /// Returns true if no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of registered listeners, muted ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<E: EngineEvent> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EngineEvent> fmt::Debug for EventListeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let muted = self.entries.iter().filter(|e| e.is_muted()).count();
        f.debug_struct("EventListeners")
            .field("len", &self.entries.len())
            .field("muted", &muted)
            .finish()
    }
}

/// What the engine knows about one contained listener panic.
#[cfg_attr(not(any(feature = "tracing", feature = "metrics")), allow(dead_code))]
struct ListenerPanic<'a> {
    pipeline: &'a str,
    event_type: &'static str,
    strikes: u32,
    muted: bool,
    message: String,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast::<&'static str>()
            .map(|s| (*s).to_string())
            .unwrap_or_else(|_| "opaque panic payload".to_string()),
    }
}

fn report_listener_panic(report: ListenerPanic<'_>) {
    #[cfg(feature = "tracing")]
    if report.muted {
        tracing::error!(
            pipeline = report.pipeline,
            event_type = report.event_type,
            strikes = report.strikes,
            panic = %report.message,
            "event listener muted after repeated panics"
        );
    } else {
        tracing::warn!(
            pipeline = report.pipeline,
            event_type = report.event_type,
            strikes = report.strikes,
            panic = %report.message,
            "event listener panicked"
        );
    }

    #[cfg(feature = "metrics")]
    {
        metrics::counter!(
            "rivulet_listener_panics_total",
            "pipeline" => report.pipeline.to_string(),
            "event_type" => report.event_type.to_string()
        )
        .increment(1);
        if report.muted {
            metrics::counter!(
                "rivulet_listeners_muted_total",
                "pipeline" => report.pipeline.to_string()
            )
            .increment(1);
        }
    }

    #[cfg(not(any(feature = "tracing", feature = "metrics")))]
    let _ = report;
}

/// Adapts a plain closure into an [`EventListener`].
pub struct FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    f: F,
    _phantom: std::marker::PhantomData<fn(&E)>,
}

impl<E, F> FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    /// Wraps `f` as a listener.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<E, F> EventListener<E> for FnListener<E, F>
where
    E: EngineEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}
