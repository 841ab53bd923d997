//! # Object Store Benchmark Suite
//!
//! A concurrent benchmark suite for remote object stores, built around a
//! bounded completion-queue admission layer. Workers issue put/get
//! requests either synchronously or through fixed-capacity
//! [`EventQueue`]s, and a harness sweeps a configuration matrix of value
//! sizes, inflight caps, and thread counts, recording per-iteration
//! durations alongside the time spent blocked on backpressure.
//!
//! ## Architecture Overview
//!
//! - `store`: the `ObjectStore` capability trait the core consumes, plus
//!   the in-process `MemoryStore` backend the suite runs against
//! - `queue`: the `EventQueue` admission/completion layer
//! - `driver`: the multi-threaded workload driver with its shared
//!   request countdown
//! - `config`: parameter ranges and the sweep matrix
//! - `measurement`: repetition loop and timing samples
//! - `results`: aggregation and JSON output
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use objstore_bench::{
//!     config::MatrixConfig,
//!     driver::{WorkloadDriver, WorkloadOptions},
//!     measurement::Harness,
//!     store::{MemoryStore, ObjectStore},
//! };
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
//!     let pool = store.connect("bench")?;
//!     let driver = WorkloadDriver::new(store, pool, WorkloadOptions::default());
//!     let harness = Harness::new(driver, MatrixConfig::default().configurations()?);
//!     let results = harness.measure();
//!     println!("collected {} configurations", results.len());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod measurement;
pub mod queue;
pub mod results;
pub mod store;

pub use cli::Args;
pub use config::{MatrixConfig, ParameterRange, RangeKind, TestConfiguration};
pub use driver::{WorkloadDriver, WorkloadOptions};
pub use error::{Error, Result};
pub use measurement::{ConfigResult, Harness, TimingSample};
pub use queue::{Event, EventQueue};
pub use results::{ResultsManager, SweepResults};
pub use store::{MemoryStore, ObjectKind, ObjectStore};

/// The current version of the benchmark suite, taken from Cargo.toml and
/// embedded in result output for reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    /// Requests issued per timed iteration.
    pub const REQUESTS_PER_ITERATION: usize = 1000;

    /// Timed repetitions per matrix point.
    pub const REPETITIONS: usize = 10;

    /// Results are written here unless overridden.
    pub const OUTPUT_FILE: &str = "benchmark_results.json";

    /// Test-matrix file looked up in the working directory.
    pub const MATRIX_FILE: &str = "bench_matrix.toml";

    /// Array objects are laid out with this many cells per chunk.
    pub const ARRAY_CHUNK_CELLS: usize = 64;
}
