//! Invariants tested:
//! - Count conservation: outputs + failures = items consumed
//! - Ordered output is exactly the successes in source order
//! - Attempts per item never exceed 1 + max_retries

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{stream, StreamExt};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use tokio::runtime::Runtime;

use rivulet::{map_parallel, map_parallel_stream, ErrorMode, ParallelOptions, PipelineError};

#[derive(Debug, Clone, PartialEq)]
struct TestError;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Outputs plus recorded failures always add up to the input count.
    #[test]
    fn count_conservation(
        item_count in 0usize..60,
        failing in proptest::collection::hash_set(0u64..60, 0..20),
        parallelism in 1usize..8,
    ) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let failing: HashSet<u64> = failing;
            let failing_clone = failing.clone();

            let result = map_parallel(
                stream::iter(0..item_count as u64),
                move |x, _| {
                    let failing = failing_clone.clone();
                    async move {
                        if failing.contains(&x) {
                            Err(TestError)
                        } else {
                            Ok(x)
                        }
                    }
                },
                ParallelOptions::new()
                    .max_parallelism(parallelism)
                    .error_mode(ErrorMode::CollectAndContinue),
            )
            .await;

            let expected_failures = failing
                .iter()
                .filter(|x| **x < item_count as u64)
                .count();

            match result {
                Ok(outputs) => {
                    prop_assert_eq!(expected_failures, 0);
                    prop_assert_eq!(outputs.len(), item_count);
                }
                Err(PipelineError::Aggregate(errors)) => {
                    prop_assert_eq!(errors.len(), expected_failures);
                }
                Err(other) => return Err(TestCaseError::fail(format!("unexpected {other:?}"))),
            }
            Ok(())
        })?;
    }

    /// Ordered output is exactly the successful items, in source order.
    #[test]
    fn ordered_output_is_source_order(
        item_count in 1usize..50,
        failing in proptest::collection::hash_set(0u64..50, 0..10),
        parallelism in 1usize..6,
    ) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let failing: HashSet<u64> = failing;
            let failing_clone = failing.clone();

            let results = map_parallel_stream(
                stream::iter(0..item_count as u64),
                move |x, _| {
                    let failing = failing_clone.clone();
                    async move {
                        tokio::time::sleep(Duration::from_micros((x % 7) * 100)).await;
                        if failing.contains(&x) {
                            Err(TestError)
                        } else {
                            Ok(x)
                        }
                    }
                },
                ParallelOptions::new()
                    .max_parallelism(parallelism)
                    .ordered_output(true)
                    .error_mode(ErrorMode::CollectAndContinue),
            )
            .unwrap();

            let outputs: Vec<u64> = results
                .filter_map(|item| async move { item.ok() })
                .collect()
                .await;

            let expected: Vec<u64> = (0..item_count as u64)
                .filter(|x| !failing.contains(x))
                .collect();
            prop_assert_eq!(outputs, expected);
            Ok(())
        })?;
    }

    /// Attempts per item stay within 1 + max_retries, exactly.
    #[test]
    fn attempts_are_bounded(max_retries in 0u32..4) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let attempts = Arc::new(AtomicU32::new(0));
            let attempts_clone = Arc::clone(&attempts);

            let result = map_parallel(
                stream::iter(vec![1u64]),
                move |_, _| {
                    let attempts = Arc::clone(&attempts_clone);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<u64, _>(TestError)
                    }
                },
                ParallelOptions::new()
                    .max_retries(max_retries)
                    .base_delay(Duration::from_millis(1))
                    .is_transient(|_: &TestError| true),
            )
            .await;

            prop_assert!(result.is_err());
            prop_assert_eq!(attempts.load(Ordering::SeqCst), max_retries + 1);
            Ok(())
        })?;
    }

    /// The failure indices reported in the aggregate are exactly the
    /// failing inputs.
    #[test]
    fn aggregate_reports_exact_indices(
        failing in proptest::collection::hash_set(0u64..30, 1..8),
    ) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let failing: HashSet<u64> = failing;
            let failing_clone = failing.clone();

            let result = map_parallel(
                stream::iter(0..30u64),
                move |x, _| {
                    let failing = failing_clone.clone();
                    async move {
                        if failing.contains(&x) {
                            Err(TestError)
                        } else {
                            Ok(x)
                        }
                    }
                },
                ParallelOptions::new()
                    .max_parallelism(4)
                    .error_mode(ErrorMode::CollectAndContinue),
            )
            .await;

            match result {
                Err(PipelineError::Aggregate(errors)) => {
                    let reported: HashSet<u64> = errors.iter().map(|e| e.index).collect();
                    prop_assert_eq!(reported, failing);
                }
                other => return Err(TestCaseError::fail(format!("unexpected {other:?}"))),
            }
            Ok(())
        })?;
    }
}

/// Sequential sanity check outside proptest: a long mixed run keeps every
/// invariant at once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn long_mixed_run_holds_all_invariants() {
    let attempts: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(vec![0; 500]));
    let attempts_clone = Arc::clone(&attempts);

    let mut results = map_parallel_stream(
        stream::iter(0..500u64),
        move |x, _| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                let attempt = {
                    let mut attempts = attempts.lock().unwrap();
                    attempts[x as usize] += 1;
                    attempts[x as usize]
                };
                // Every ninth item needs one retry; every 50th fails for
                // good.
                if x % 50 == 0 {
                    Err(TestError)
                } else if x % 9 == 0 && attempt == 1 {
                    Err(TestError)
                } else {
                    Ok(x)
                }
            }
        },
        ParallelOptions::new()
            .max_parallelism(8)
            .ordered_output(true)
            .max_retries(2)
            .base_delay(Duration::from_millis(1))
            .is_transient(|_: &TestError| true)
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

    let expected: Vec<u64> = (0..500).filter(|x| x % 50 != 0).collect();
    assert_eq!(outputs, expected);

    match terminal {
        Some(PipelineError::Aggregate(errors)) => {
            assert_eq!(errors.len(), 10);
            for error in &errors {
                assert_eq!(error.attempts, 3);
            }
        }
        other => panic!("expected an aggregate terminal, got {other:?}"),
    }

    for (index, count) in attempts.lock().unwrap().iter().enumerate() {
        assert!(*count <= 3, "item {index} ran {count} attempts");
    }
}
