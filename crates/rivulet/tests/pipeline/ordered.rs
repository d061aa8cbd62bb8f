//! Ordered-output behavior.

use std::time::Duration;

use futures::{stream, StreamExt};
use rand::Rng;
use rivulet::{map_parallel, map_parallel_stream, ErrorMode, ParallelOptions, PipelineError};

#[derive(Debug, Clone)]
struct TestError;

/// Items finish out of order under random delays, yet the consumer sees
/// source order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordered_mapping_preserves_source_order() {
    let result = map_parallel(
        stream::iter(1..=30u64),
        |x, _| async move {
            let delay = rand::rng().random_range(1..=10);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok::<_, TestError>(x * 2)
        },
        ParallelOptions::new().max_parallelism(6).ordered_output(true),
    )
    .await
    .unwrap();

    assert_eq!(result, (1..=30).map(|x| x * 2).collect::<Vec<_>>());
}

/// With capacity-1 queues the producer and consumer strictly alternate;
/// ordering must still hold.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordered_mapping_with_capacity_one() {
    let result = map_parallel(
        stream::iter(1..=30u64),
        |x, _| async move {
            let delay = rand::rng().random_range(1..=5);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok::<_, TestError>(x * 2)
        },
        ParallelOptions::new()
            .max_parallelism(6)
            .ordered_output(true)
            .channel_capacity(1),
    )
    .await
    .unwrap();

    assert_eq!(result, (1..=30).map(|x| x * 2).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordered_stream_is_strictly_increasing() {
    let results = map_parallel_stream(
        stream::iter(0..200u64),
        |x, _| {
            let delay = rand::rng().random_range(1..500);
            async move {
                tokio::time::sleep(Duration::from_micros(delay)).await;
                Ok::<_, TestError>(x)
            }
        },
        ParallelOptions::new().max_parallelism(8).ordered_output(true),
    )
    .unwrap();

    let collected: Vec<u64> = results.map(|item| item.unwrap()).collect().await;
    assert_eq!(collected, (0..200).collect::<Vec<_>>());
}

/// Failed items leave gaps; the survivors still come out in source order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordered_output_skips_failed_indices() {
    let mut results = map_parallel_stream(
        stream::iter(0..20u64),
        |x, _| async move {
            if x == 5 || x == 11 {
                Err(TestError)
            } else {
                Ok(x)
            }
        },
        ParallelOptions::new()
            .max_parallelism(4)
            .ordered_output(true)
            .error_mode(ErrorMode::CollectAndContinue),
    )
    .unwrap();

    let mut outputs = Vec::new();
    let mut terminal = None;
    while let Some(next) = results.next().await {
        match next {
            Ok(value) => outputs.push(value),
            Err(error) => terminal = Some(error),
        }
    }

    let expected: Vec<u64> = (0..20).filter(|x| *x != 5 && *x != 11).collect();
    assert_eq!(outputs, expected);
    match terminal {
        Some(PipelineError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected an aggregate terminal, got {other:?}"),
    }
}
