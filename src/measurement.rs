//! Sweep execution.
//!
//! The [`Harness`] walks the configuration matrix in order and runs every
//! point for its repetition count, producing one [`TimingSample`] per
//! successful repetition. A failing repetition is logged and skipped; a
//! fatal failure (bad configuration, lost connection) abandons the rest
//! of that point's repetitions. Either way the sweep itself keeps going,
//! so one broken point cannot cost a night's worth of measurements.

use crate::config::TestConfiguration;
use crate::driver::WorkloadDriver;
use crate::error::Error;
use std::time::Duration;
use tracing::{error, info};

/// Timings of one driver iteration. The duration covers issuance through
/// full completion; the backpressure wait is the summed time workers
/// spent blocked reaping, tracked separately so throughput and waiting
/// stay distinguishable.
#[derive(Debug, Clone, Copy)]
pub struct TimingSample {
    pub duration: Duration,
    pub backpressure_wait: Duration,
}

/// Samples collected for one matrix point.
#[derive(Debug)]
pub struct ConfigResult {
    pub configuration: TestConfiguration,
    pub samples: Vec<TimingSample>,
    pub failed_repetitions: usize,
}

pub struct Harness {
    driver: WorkloadDriver,
    configurations: Vec<TestConfiguration>,
}

impl Harness {
    pub fn new(driver: WorkloadDriver, configurations: Vec<TestConfiguration>) -> Self {
        Self {
            driver,
            configurations,
        }
    }

    pub fn configurations(&self) -> &[TestConfiguration] {
        &self.configurations
    }

    /// Run the full sweep and return one result per configuration, in
    /// matrix order.
    pub fn measure(&self) -> Vec<ConfigResult> {
        let total = self.configurations.len();
        let mut results = Vec::with_capacity(total);
        for (index, configuration) in self.configurations.iter().enumerate() {
            info!(
                "configuration {}/{}: {} x{}",
                index + 1,
                total,
                configuration,
                configuration.repetitions
            );
            results.push(self.measure_one(configuration));
        }
        results
    }

    fn measure_one(&self, configuration: &TestConfiguration) -> ConfigResult {
        let mut samples = Vec::with_capacity(configuration.repetitions);
        let mut failed_repetitions = 0;
        for repetition in 0..configuration.repetitions {
            match self.driver.run_iteration(configuration) {
                Ok(sample) => samples.push(sample),
                Err(err) => {
                    error!(
                        "configuration [{configuration}] repetition {}/{} failed: {err}",
                        repetition + 1,
                        configuration.repetitions
                    );
                    failed_repetitions += 1;
                    if matches!(err, Error::Config(_) | Error::Connection(_)) {
                        // Retrying a bad configuration or a dead
                        // connection only repeats the failure.
                        failed_repetitions = configuration.repetitions - samples.len();
                        break;
                    }
                }
            }
        }
        ConfigResult {
            configuration: *configuration,
            samples,
            failed_repetitions,
        }
    }
}
