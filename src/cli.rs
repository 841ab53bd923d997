use crate::driver::{Operation, Placement, WorkloadOptions};
use crate::store::ObjectKind;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Object Store Benchmark Suite - completion-queue workloads against a
/// remote object store
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Pool label or id to connect to
    #[clap(short, long, default_value = "bench")]
    pub pool: String,

    /// Test-matrix file (TOML); built-in defaults are used if absent
    #[clap(short = 'm', long, default_value = crate::defaults::MATRIX_FILE)]
    pub matrix: PathBuf,

    /// Output file for results (JSON format)
    #[clap(short, long, default_value = crate::defaults::OUTPUT_FILE)]
    pub output_file: PathBuf,

    /// Object flavor the workload targets
    #[clap(long, value_enum, default_value_t = WorkloadObject::Kv)]
    pub object: WorkloadObject,

    /// Request type the workers issue
    #[clap(long, value_enum, default_value_t = Operation::Put)]
    pub operation: Operation,

    /// Container placement across workers
    #[clap(long, value_enum, default_value_t = Placement::Shared)]
    pub containers: Placement,

    /// Requests issued per iteration
    #[clap(short, long, default_value_t = crate::defaults::REQUESTS_PER_ITERATION)]
    pub requests: usize,

    /// Override the matrix file's repetition count
    #[clap(long)]
    pub repetitions: Option<usize>,

    /// Simulated backend completion latency in microseconds
    #[clap(long, default_value_t = 0)]
    pub completion_delay_us: u64,

    /// Pin worker threads to CPU cores
    #[clap(long, default_value_t = false)]
    pub pin_workers: bool,

    /// Verbose output
    #[clap(short, long, default_value_t = false)]
    pub verbose: bool,
}

/// Object flavors available to the workload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum WorkloadObject {
    /// Key-value object
    #[clap(name = "kv")]
    Kv,

    /// Array object
    #[clap(name = "array")]
    Array,
}

impl std::fmt::Display for WorkloadObject {
    // Matches the clap value names so default_value_t round-trips.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadObject::Kv => write!(f, "kv"),
            WorkloadObject::Array => write!(f, "array"),
        }
    }
}

impl From<WorkloadObject> for ObjectKind {
    fn from(object: WorkloadObject) -> Self {
        match object {
            WorkloadObject::Kv => ObjectKind::KeyValue,
            WorkloadObject::Array => ObjectKind::Array,
        }
    }
}

impl Args {
    /// Scenario options for the driver, as selected on the command line.
    pub fn workload_options(&self) -> WorkloadOptions {
        WorkloadOptions {
            object: self.object.into(),
            operation: self.operation,
            placement: self.containers,
            requests: self.requests,
            pin_workers: self.pin_workers,
        }
    }
}
