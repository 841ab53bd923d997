//! Test-matrix configuration.
//!
//! A sweep is described by three parameter ranges (value chunk size,
//! inflight cap, worker threads) and a repetition count. Each range is
//! either dense (linear steps) or log (geometric, `step` as multiplier),
//! and the matrix is their Cartesian product. Matrix files are TOML:
//!
//! ```toml
//! [chunk_size]
//! min = 1024
//! max = 10240
//! step = 512
//! range_type = "dense"
//!
//! [inflight_events]
//! min = 0
//! max = 128
//! step = 2
//! range_type = "log"
//!
//! [threads]
//! min = 1
//! max = 8
//! step = 2
//! range_type = "log"
//!
//! repetitions = 10
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a [`ParameterRange`] expands into concrete values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeKind {
    /// min, min+step, min+2*step, ... while <= max.
    Dense,
    /// min, then powers of `step` up to and including max.
    #[default]
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterRange {
    pub min: i64,
    pub max: i64,
    pub step: i64,
    pub range_type: RangeKind,
}

impl Default for ParameterRange {
    fn default() -> Self {
        Self {
            min: 1,
            max: 1,
            step: 2,
            range_type: RangeKind::Log,
        }
    }
}

impl ParameterRange {
    /// A range that expands to exactly one value.
    pub fn fixed(value: i64) -> Self {
        Self {
            min: value,
            max: value,
            ..Self::default()
        }
    }

    pub fn dense(min: i64, max: i64, step: i64) -> Self {
        Self {
            min,
            max,
            step,
            range_type: RangeKind::Dense,
        }
    }

    pub fn log(min: i64, max: i64, step: i64) -> Self {
        Self {
            min,
            max,
            step,
            range_type: RangeKind::Log,
        }
    }

    /// Expand to the concrete values, endpoints included.
    pub fn values(&self) -> Result<Vec<i64>> {
        if self.min < 0 {
            return Err(Error::Config(format!(
                "range minimum must not be negative, got {}",
                self.min
            )));
        }
        if self.max < self.min {
            return Err(Error::Config(format!(
                "range maximum {} is below minimum {}",
                self.max, self.min
            )));
        }
        match self.range_type {
            RangeKind::Dense => {
                if self.step <= 0 {
                    return Err(Error::Config("dense range step must be positive".into()));
                }
                let mut values = Vec::new();
                let mut v = self.min;
                while v <= self.max {
                    values.push(v);
                    v += self.step;
                }
                Ok(values)
            }
            RangeKind::Log => {
                if self.step < 2 {
                    return Err(Error::Config(
                        "log range step is the multiplier and must be at least 2".into(),
                    ));
                }
                let mut values = vec![self.min];
                let mut v = self.min.max(1);
                if v > self.min && v < self.max {
                    values.push(v);
                }
                loop {
                    v = v.saturating_mul(self.step);
                    if v >= self.max {
                        break;
                    }
                    values.push(v);
                }
                if self.max > self.min {
                    values.push(self.max);
                }
                Ok(values)
            }
        }
    }
}

/// One point of the sweep matrix. Immutable once generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestConfiguration {
    /// Value payload size in bytes (and cell size for array objects).
    pub chunk_size: usize,
    /// Maximum concurrent outstanding operations per queue. Zero or
    /// negative selects synchronous mode: no queue is created.
    pub inflight_cap: i64,
    /// Worker threads issuing requests.
    pub threads: usize,
    /// Timed repetitions of this point.
    pub repetitions: usize,
}

impl TestConfiguration {
    pub fn is_async(&self) -> bool {
        self.inflight_cap > 0
    }
}

impl std::fmt::Display for TestConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "chunk={}B inflight={} threads={}",
            self.chunk_size, self.inflight_cap, self.threads
        )
    }
}

fn default_chunk_range() -> ParameterRange {
    ParameterRange::dense(1024, 10 * 1024, 512)
}

fn default_inflight_range() -> ParameterRange {
    ParameterRange::dense(2, 200, 50)
}

fn default_threads_range() -> ParameterRange {
    ParameterRange::log(1, num_cpus::get() as i64, 8)
}

fn default_repetitions() -> usize {
    crate::defaults::REPETITIONS
}

/// Sweep description as loaded from a matrix file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    #[serde(default = "default_chunk_range")]
    pub chunk_size: ParameterRange,
    #[serde(default = "default_inflight_range")]
    pub inflight_events: ParameterRange,
    #[serde(default = "default_threads_range")]
    pub threads: ParameterRange,
    #[serde(default = "default_repetitions")]
    pub repetitions: usize,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_range(),
            inflight_events: default_inflight_range(),
            threads: default_threads_range(),
            repetitions: default_repetitions(),
        }
    }
}

impl MatrixConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("cannot read {}: {err}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::Config(format!("bad matrix file: {err}")))
    }

    /// Generate the Cartesian product of the three ranges.
    pub fn configurations(&self) -> Result<Vec<TestConfiguration>> {
        if self.repetitions == 0 {
            return Err(Error::Config("repetitions must be at least 1".into()));
        }
        let chunks = self.chunk_size.values()?;
        let inflight = self.inflight_events.values()?;
        let threads = self.threads.values()?;

        let mut configurations =
            Vec::with_capacity(chunks.len() * inflight.len() * threads.len());
        for &chunk_size in &chunks {
            if chunk_size <= 0 {
                return Err(Error::Config("chunk size must be positive".into()));
            }
            for &inflight_cap in &inflight {
                for &thread_count in &threads {
                    if thread_count == 0 {
                        return Err(Error::Config(
                            "at least one worker thread is required".into(),
                        ));
                    }
                    configurations.push(TestConfiguration {
                        chunk_size: chunk_size as usize,
                        inflight_cap,
                        threads: thread_count as usize,
                        repetitions: self.repetitions,
                    });
                }
            }
        }
        Ok(configurations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_range_includes_both_endpoints() {
        let values = ParameterRange::dense(2, 10, 4).values().unwrap();
        assert_eq!(values, vec![2, 6, 10]);
    }

    #[test]
    fn log_range_is_powers_of_step_capped_at_max() {
        let values = ParameterRange::log(1, 8, 2).values().unwrap();
        assert_eq!(values, vec![1, 2, 4, 8]);

        let values = ParameterRange::log(8, 100, 2).values().unwrap();
        assert_eq!(values, vec![8, 16, 32, 64, 100]);
    }

    #[test]
    fn log_range_with_zero_minimum_keeps_the_sentinel() {
        let values = ParameterRange::log(0, 8, 2).values().unwrap();
        assert_eq!(values, vec![0, 1, 2, 4, 8]);
    }

    #[test]
    fn fixed_range_is_a_single_value() {
        assert_eq!(ParameterRange::fixed(7).values().unwrap(), vec![7]);
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        assert!(ParameterRange::dense(1, 10, 0).values().is_err());
        assert!(ParameterRange::log(1, 10, 1).values().is_err());
        assert!(ParameterRange::dense(10, 1, 1).values().is_err());
        assert!(ParameterRange::dense(-1, 1, 1).values().is_err());
    }

    #[test]
    fn matrix_is_the_cartesian_product() {
        let matrix = MatrixConfig {
            chunk_size: ParameterRange::dense(64, 128, 64),
            inflight_events: ParameterRange::dense(0, 8, 8),
            threads: ParameterRange::dense(1, 2, 1),
            repetitions: 3,
        };
        let configurations = matrix.configurations().unwrap();
        assert_eq!(configurations.len(), 2 * 2 * 2);
        assert!(configurations.iter().all(|c| c.repetitions == 3));
        // Sentinel points are kept, they select synchronous mode.
        assert!(configurations.iter().any(|c| !c.is_async()));
    }

    #[test]
    fn zero_threads_is_a_configuration_error() {
        let matrix = MatrixConfig {
            threads: ParameterRange::dense(0, 1, 1),
            repetitions: 1,
            ..MatrixConfig::default()
        };
        assert!(matches!(
            matrix.configurations(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn parse_reads_the_documented_keys() {
        let matrix = MatrixConfig::parse(
            r#"
            repetitions = 4

            [chunk_size]
            min = 1024
            max = 4096
            step = 1024
            range_type = "dense"

            [inflight_events]
            min = 0
            max = 16
            step = 4
            range_type = "log"

            [threads]
            min = 1
            max = 4
            step = 2
            range_type = "log"
            "#,
        )
        .unwrap();
        assert_eq!(matrix.repetitions, 4);
        assert_eq!(matrix.chunk_size.values().unwrap(), vec![1024, 2048, 3072, 4096]);
        assert_eq!(matrix.inflight_events.values().unwrap(), vec![0, 1, 4, 16]);
        assert_eq!(matrix.threads.values().unwrap(), vec![1, 2, 4]);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let matrix = MatrixConfig::parse("repetitions = 2").unwrap();
        assert_eq!(matrix.repetitions, 2);
        assert!(!matrix.chunk_size.values().unwrap().is_empty());
        assert!(!matrix.threads.values().unwrap().is_empty());
    }

    #[test]
    fn load_reads_a_matrix_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.toml");
        std::fs::write(&path, "repetitions = 7").unwrap();
        assert_eq!(MatrixConfig::load(&path).unwrap().repetitions, 7);
        assert!(matches!(
            MatrixConfig::load(&dir.path().join("absent.toml")),
            Err(Error::Config(_))
        ));
    }
}
