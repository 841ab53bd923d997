//! Benchmark suite entry point.
//!
//! Wires the pieces together in order: logging, argument parsing, matrix
//! loading, store connection, the sweep itself, and finally the results
//! file. Fatal setup failures (unreadable matrix, failed connection)
//! abort the run; per-configuration failures are handled inside the
//! harness and reported in the results instead.

use anyhow::{Context, Result};
use clap::Parser;
use objstore_bench::{
    cli::Args,
    config::MatrixConfig,
    driver::WorkloadDriver,
    logging,
    measurement::Harness,
    results::ResultsManager,
    store::{MemoryOptions, MemoryStore, ObjectStore},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    info!("Starting Object Store Benchmark Suite");
    info!(
        "workload: {} {} on {} containers, {} requests per iteration",
        args.operation, args.object, args.containers, args.requests
    );

    let matrix = if args.matrix.exists() {
        MatrixConfig::load(&args.matrix)
            .with_context(|| format!("loading matrix file {:?}", args.matrix))?
    } else {
        warn!(
            "matrix file {:?} not found, using built-in defaults",
            args.matrix
        );
        MatrixConfig::default()
    };

    let mut configurations = matrix.configurations().context("generating test matrix")?;
    if let Some(repetitions) = args.repetitions {
        for configuration in &mut configurations {
            configuration.repetitions = repetitions;
        }
    }
    info!("generated {} configurations", configurations.len());

    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::with_options(MemoryOptions {
        completion_delay: Duration::from_micros(args.completion_delay_us),
        ..MemoryOptions::default()
    }));
    let pool = store
        .connect(&args.pool)
        .with_context(|| format!("connecting to pool {:?}", args.pool))?;

    let driver = WorkloadDriver::new(Arc::clone(&store), pool, args.workload_options());
    let harness = Harness::new(driver, configurations);

    let mut manager = ResultsManager::new(&args.output_file);
    for result in harness.measure() {
        manager.add(&result)?;
    }
    manager.finalize()?;

    store.disconnect(pool)?;
    info!("collected {} data points", manager.sample_count());
    Ok(())
}
