//! Lifecycle hooks: ordering, isolation, drain, throttle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream;
use rivulet::{map_parallel, ErrorMode, EventListener, ParallelOptions, PipelineEvent};

#[derive(Debug, Clone)]
struct TestError;

/// Hooks that panic on every call must not change how many items succeed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_hooks_do_not_reduce_output() {
    let attempts: Arc<Mutex<HashMap<u64, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let attempts_clone = Arc::clone(&attempts);

    let result = map_parallel(
        stream::iter(0..20u64),
        move |x, _| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                let attempt = {
                    let mut attempts = attempts.lock().unwrap();
                    let entry = attempts.entry(x).or_insert(0);
                    *entry += 1;
                    *entry
                };
                // Every fifth item fails its first attempt only.
                if x % 5 == 0 && attempt == 1 {
                    Err(TestError)
                } else {
                    Ok(x)
                }
            }
        },
        ParallelOptions::new()
            .max_parallelism(4)
            .max_retries(3)
            .base_delay(Duration::from_millis(1))
            .is_transient(|_: &TestError| true)
            .on_start_item(|_| panic!("start hook bug"))
            .on_complete_item(|_| panic!("complete hook bug"))
            .on_retry(|_, _, _| async { panic!("retry hook bug") })
            .on_drain(|| async { panic!("drain hook bug") }),
    )
    .await
    .unwrap();

    assert_eq!(result.len(), 20);
}

/// Per item: start fires before complete, exactly once each.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_and_complete_pair_up_in_order() {
    #[derive(Default, Clone, Copy)]
    struct Seen {
        started: u32,
        completed: u32,
        out_of_order: bool,
    }

    let seen: Arc<Mutex<HashMap<u64, Seen>>> = Arc::new(Mutex::new(HashMap::new()));
    let started_seen = Arc::clone(&seen);
    let completed_seen = Arc::clone(&seen);

    map_parallel(
        stream::iter(0..50u64),
        |x, _| async move { Ok::<_, TestError>(x) },
        ParallelOptions::new()
            .max_parallelism(4)
            .on_start_item(move |index| {
                started_seen.lock().unwrap().entry(index).or_default().started += 1;
            })
            .on_complete_item(move |index| {
                let mut seen = completed_seen.lock().unwrap();
                let entry = seen.entry(index).or_default();
                if entry.started == 0 {
                    entry.out_of_order = true;
                }
                entry.completed += 1;
            }),
    )
    .await
    .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 50);
    for (index, entry) in seen.iter() {
        assert_eq!((entry.started, entry.completed), (1, 1), "item {index}");
        assert!(!entry.out_of_order, "item {index} completed before starting");
    }
}

#[tokio::test]
async fn drain_hook_fires_exactly_once() {
    let drains = Arc::new(AtomicUsize::new(0));
    let drains_clone = Arc::clone(&drains);

    map_parallel(
        stream::iter(0..10u64),
        |x, _| async move { Ok::<_, TestError>(x) },
        ParallelOptions::new().max_parallelism(2).on_drain(move || {
            let drains = Arc::clone(&drains_clone);
            async move {
                drains.fetch_add(1, Ordering::SeqCst);
            }
        }),
    )
    .await
    .unwrap();

    assert_eq!(drains.load(Ordering::SeqCst), 1);
}

/// The drain hook fires even when the run ends in failure.
#[tokio::test]
async fn drain_hook_fires_on_failed_runs() {
    let drains = Arc::new(AtomicUsize::new(0));
    let drains_clone = Arc::clone(&drains);

    let result = map_parallel(
        stream::iter(0..10u64),
        |_, _| async move { Err::<u64, _>(TestError) },
        ParallelOptions::new().max_parallelism(2).on_drain(move || {
            let drains = Arc::clone(&drains_clone);
            async move {
                drains.fetch_add(1, Ordering::SeqCst);
            }
        }),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(drains.load(Ordering::SeqCst), 1);
}

/// A single saturated worker grinding through a long backlog reports
/// throttling.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn throttle_hook_reports_saturation() {
    let throttles = Arc::new(AtomicUsize::new(0));
    let throttles_clone = Arc::clone(&throttles);

    map_parallel(
        stream::iter(0..200u64),
        |x, _| async move {
            tokio::time::sleep(Duration::from_micros(500)).await;
            Ok::<_, TestError>(x)
        },
        ParallelOptions::new()
            .max_parallelism(1)
            .on_throttle(move |_in_flight| {
                let throttles = Arc::clone(&throttles_clone);
                async move {
                    throttles.fetch_add(1, Ordering::SeqCst);
                }
            }),
    )
    .await
    .unwrap();

    assert!(
        throttles.load(Ordering::SeqCst) >= 1,
        "saturated pool never reported throttling"
    );
}

/// Event listeners see the same run the hooks do.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn event_listener_observes_completions() {
    struct Completions(AtomicUsize);
    impl EventListener<PipelineEvent> for Completions {
        fn on_event(&self, event: &PipelineEvent) {
            if let PipelineEvent::ItemCompleted { .. } = event {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    let completions = Arc::new(Completions(AtomicUsize::new(0)));
    let listener = Arc::clone(&completions);

    map_parallel(
        stream::iter(0..30u64),
        |x, _| async move { Ok::<_, TestError>(x) },
        ParallelOptions::new()
            .max_parallelism(4)
            .on_event(rivulet::FnListener::new(move |event: &PipelineEvent| {
                listener.on_event(event)
            })),
    )
    .await
    .unwrap();

    assert_eq!(completions.0.load(Ordering::SeqCst), 30);
}

/// A dropped failure still shows up in the counters even though nothing
/// else mentions it.
#[tokio::test]
async fn dropped_items_are_counted() {
    let metrics = Arc::new(rivulet::PipelineMetrics::default());

    let result = map_parallel(
        stream::iter(0..10u64),
        |x, _| async move {
            if x % 2 == 0 {
                Err(TestError)
            } else {
                Ok(x)
            }
        },
        ParallelOptions::new()
            .max_parallelism(2)
            .error_mode(ErrorMode::BestEffort)
            .metrics(Arc::clone(&metrics)),
    )
    .await
    .unwrap();

    assert_eq!(result.len(), 5);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.items_dropped, 5);
    assert_eq!(snapshot.items_completed, 5);
    assert_eq!(snapshot.items_started, 10);
}
