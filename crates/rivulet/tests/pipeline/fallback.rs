//! Fallback values for exhausted items.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream;
use rivulet::{map_parallel, ParallelOptions, PipelineError};

#[derive(Debug, Clone)]
struct TestError;

/// Input `[1, 2, 3]`, transform fails on 2; the fallback fills the hole.
#[tokio::test]
async fn fallback_replaces_the_failed_item() {
    let mut result = map_parallel(
        stream::iter(vec![1i64, 2, 3]),
        |x, _| async move {
            if x == 2 {
                Err(TestError)
            } else {
                Ok(x * 2)
            }
        },
        ParallelOptions::new()
            .max_parallelism(2)
            .max_retries(1)
            .base_delay(Duration::from_millis(1))
            .is_transient(|_: &TestError| true)
            .on_fallback(|_index, _failure| -1),
    )
    .await
    .unwrap();

    result.sort_unstable();
    assert_eq!(result, vec![-1, 2, 6]);
}

/// The fallback hook can tell a timeout from a transform error.
#[tokio::test]
async fn fallback_observes_timeout_failures() {
    let saw_timeout = Arc::new(AtomicBool::new(false));
    let saw_timeout_clone = Arc::clone(&saw_timeout);

    let result = map_parallel(
        stream::iter(vec![1u64]),
        |x, _| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, TestError>(x)
        },
        ParallelOptions::new()
            .per_item_timeout(Duration::from_millis(20))
            .on_fallback(move |_index, failure| {
                saw_timeout_clone.store(failure.is_timeout(), Ordering::SeqCst);
                0
            }),
    )
    .await
    .unwrap();

    assert_eq!(result, vec![0]);
    assert!(saw_timeout.load(Ordering::SeqCst));
}

/// A panicking fallback degrades to the failure it was replacing.
#[tokio::test]
async fn panicking_fallback_surfaces_the_failure() {
    let result = map_parallel(
        stream::iter(vec![1u64]),
        |_, _| async move { Err::<u64, _>(TestError) },
        ParallelOptions::new().on_fallback(|_index, _failure| panic!("fallback bug")),
    )
    .await;

    match result {
        Err(PipelineError::Item(error)) => assert_eq!(error.index, 0),
        other => panic!("expected an item error, got {other:?}"),
    }
}

/// Fallback values count as completions, not failures.
#[tokio::test]
async fn fallback_counts_as_completion() {
    let metrics = Arc::new(rivulet::PipelineMetrics::default());

    map_parallel(
        stream::iter(vec![1u64, 2, 3]),
        |x, _| async move {
            if x == 2 {
                Err(TestError)
            } else {
                Ok(x)
            }
        },
        ParallelOptions::new()
            .on_fallback(|_index, _failure| 0)
            .metrics(Arc::clone(&metrics)),
    )
    .await
    .unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.items_completed, 3);
    assert_eq!(snapshot.total_failures, 0);
}
