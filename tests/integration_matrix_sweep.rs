use anyhow::Result;
use objstore_bench::{
    config::MatrixConfig,
    driver::{WorkloadDriver, WorkloadOptions},
    measurement::Harness,
    results::{ResultsManager, SweepResults},
    store::{MemoryStore, ObjectStore},
};
use std::sync::Arc;

/// Drive a small matrix end-to-end and check the results file.
///
/// This is the whole pipeline in one sitting: matrix parsing, sweep
/// execution across synchronous and asynchronous points, aggregation,
/// and JSON output.
#[test]
fn matrix_sweep_produces_a_complete_results_file() -> Result<()> {
    let matrix = MatrixConfig::parse(
        r#"
        repetitions = 2

        [chunk_size]
        min = 64
        max = 128
        step = 64
        range_type = "dense"

        [inflight_events]
        min = 0
        max = 8
        step = 8
        range_type = "dense"

        [threads]
        min = 1
        max = 2
        step = 1
        range_type = "dense"
        "#,
    )?;
    let configurations = matrix.configurations()?;
    assert_eq!(configurations.len(), 2 * 2 * 2);

    let backing = Arc::new(MemoryStore::new());
    let store: Arc<dyn ObjectStore> = backing.clone();
    let pool = store.connect("sweep-test")?;
    let driver = WorkloadDriver::new(
        Arc::clone(&store),
        pool,
        WorkloadOptions {
            requests: 64,
            ..WorkloadOptions::default()
        },
    );
    let harness = Harness::new(driver, configurations);

    let dir = tempfile::tempdir()?;
    let output = dir.path().join("sweep.json");
    let mut manager = ResultsManager::new(&output);
    for result in harness.measure() {
        manager.add(&result)?;
    }
    manager.finalize()?;

    // Every configuration ran every repetition.
    let parsed: SweepResults = serde_json::from_str(&std::fs::read_to_string(&output)?)?;
    assert_eq!(parsed.metadata.total_configurations, 8);
    for report in &parsed.results {
        assert_eq!(report.samples.len(), 2);
        assert_eq!(report.failed_repetitions, 0);
        assert_eq!(report.summary.samples, 2);
    }

    // Synchronous points never touch a completion queue; the four async
    // points created one queue per worker thread per repetition.
    let expected_queues: u64 = parsed
        .results
        .iter()
        .filter(|r| r.configuration.is_async())
        .map(|r| (r.configuration.threads * r.configuration.repetitions) as u64)
        .sum();
    assert_eq!(backing.queues_created(), expected_queues);

    // The join barrier ran teardown for every iteration.
    assert_eq!(backing.containers_live(), 0);
    Ok(())
}

/// Backpressure waiting shows up in the samples once the inflight cap is
/// far below the request count and completions are slow.
#[test]
fn constrained_async_sweep_reports_backpressure_wait() -> Result<()> {
    let backing = Arc::new(MemoryStore::with_delay(std::time::Duration::from_millis(1)));
    let store: Arc<dyn ObjectStore> = backing;
    let pool = store.connect("backpressure-test")?;
    let driver = WorkloadDriver::new(
        Arc::clone(&store),
        pool,
        WorkloadOptions {
            requests: 32,
            ..WorkloadOptions::default()
        },
    );
    let configurations = vec![objstore_bench::TestConfiguration {
        chunk_size: 64,
        inflight_cap: 2,
        threads: 1,
        repetitions: 1,
    }];
    let results = Harness::new(driver, configurations).measure();
    assert_eq!(results[0].samples.len(), 1);
    let sample = results[0].samples[0];
    assert!(sample.backpressure_wait > std::time::Duration::ZERO);
    assert!(sample.duration >= sample.backpressure_wait);
    Ok(())
}
