//! Result aggregation and output.
//!
//! Samples from the sweep are summarized with an HDR histogram per
//! configuration and written as pretty JSON together with run metadata,
//! so a results file is self-describing enough to compare across hosts
//! and revisions.

use crate::config::TestConfiguration;
use crate::measurement::{ConfigResult, TimingSample};
use anyhow::{Context, Result};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// One recorded repetition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleReport {
    pub duration_ns: u64,
    pub backpressure_wait_ns: u64,
}

impl From<&TimingSample> for SampleReport {
    fn from(sample: &TimingSample) -> Self {
        Self {
            duration_ns: sample.duration.as_nanos() as u64,
            backpressure_wait_ns: sample.backpressure_wait.as_nanos() as u64,
        }
    }
}

/// Distribution of iteration durations for one configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSummary {
    pub samples: usize,
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
    /// Summed across repetitions and workers.
    pub total_backpressure_wait_ns: u64,
}

impl TimingSummary {
    pub fn from_samples(samples: &[TimingSample]) -> Result<Self> {
        let mut histogram = Histogram::<u64>::new(3).context("building duration histogram")?;
        let mut total_wait = 0u64;
        for sample in samples {
            // The histogram cannot record zero, and a sub-nanosecond
            // iteration is indistinguishable from one anyway.
            histogram
                .record((sample.duration.as_nanos() as u64).max(1))
                .context("recording duration")?;
            total_wait += sample.backpressure_wait.as_nanos() as u64;
        }
        Ok(Self {
            samples: samples.len(),
            min_ns: histogram.min(),
            max_ns: histogram.max(),
            mean_ns: histogram.mean(),
            p50_ns: histogram.value_at_percentile(50.0),
            p95_ns: histogram.value_at_percentile(95.0),
            p99_ns: histogram.value_at_percentile(99.0),
            total_backpressure_wait_ns: total_wait,
        })
    }
}

/// Everything recorded for one matrix point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigReport {
    pub configuration: TestConfiguration,
    pub summary: TimingSummary,
    pub samples: Vec<SampleReport>,
    pub failed_repetitions: usize,
}

/// Host details captured for reproducibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
}

impl SystemInfo {
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_configurations: usize,
    pub system: SystemInfo,
}

/// Top-level structure of a results file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResults {
    pub metadata: RunMetadata,
    pub results: Vec<ConfigReport>,
}

/// Collects per-configuration results and writes the final JSON file.
pub struct ResultsManager {
    output_file: PathBuf,
    reports: Vec<ConfigReport>,
}

impl ResultsManager {
    pub fn new(output_file: &Path) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
            reports: Vec::new(),
        }
    }

    pub fn add(&mut self, result: &ConfigResult) -> Result<()> {
        let summary = TimingSummary::from_samples(&result.samples)?;
        self.reports.push(ConfigReport {
            configuration: result.configuration,
            summary,
            samples: result.samples.iter().map(SampleReport::from).collect(),
            failed_repetitions: result.failed_repetitions,
        });
        Ok(())
    }

    pub fn reports(&self) -> &[ConfigReport] {
        &self.reports
    }

    /// Total successful repetitions across the sweep.
    pub fn sample_count(&self) -> usize {
        self.reports.iter().map(|r| r.samples.len()).sum()
    }

    /// Write the consolidated results file.
    pub fn finalize(&self) -> Result<()> {
        let results = SweepResults {
            metadata: RunMetadata {
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                total_configurations: self.reports.len(),
                system: SystemInfo::collect(),
            },
            results: self.reports.clone(),
        };
        let json = serde_json::to_string_pretty(&results).context("serializing results")?;
        std::fs::write(&self.output_file, json)
            .with_context(|| format!("writing {}", self.output_file.display()))?;
        info!("results written to {:?}", self.output_file);
        Ok(())
    }
}
