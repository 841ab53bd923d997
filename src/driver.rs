//! Concurrent workload driver.
//!
//! The driver issues a fixed number of put or get requests against one
//! pool, in one of four shapes: single- or multi-threaded, synchronous or
//! through per-worker [`EventQueue`]s. Work is distributed with a shared
//! atomic countdown rather than a static partition, so slow requests do
//! not leave one worker holding the bag: each worker claims the next
//! request index until the counter runs out. Every worker drains its
//! queue before reporting, and the driver joins all workers before the
//! timing sample is finalized and the iteration's containers are removed.

use crate::config::TestConfiguration;
use crate::error::{Error, Result};
use crate::measurement::TimingSample;
use crate::queue::EventQueue;
use crate::store::{array_key, ContainerHandle, ObjectHandle, ObjectKind, ObjectStore, PoolHandle};
use clap::ValueEnum;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Request type the workers issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Put,
    Get,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Put => write!(f, "put"),
            Operation::Get => write!(f, "get"),
        }
    }
}

/// Container placement across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Placement {
    /// All workers target one container and object.
    Shared,
    /// Each worker gets its own container and object.
    #[clap(name = "per-worker")]
    PerWorker,
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Placement::Shared => write!(f, "shared"),
            Placement::PerWorker => write!(f, "per-worker"),
        }
    }
}

/// Scenario-level knobs that stay fixed across the whole sweep.
#[derive(Debug, Clone)]
pub struct WorkloadOptions {
    pub object: ObjectKind,
    pub operation: Operation,
    pub placement: Placement,
    /// Requests issued per iteration.
    pub requests: usize,
    /// Pin each worker thread to a CPU core.
    pub pin_workers: bool,
}

impl Default for WorkloadOptions {
    fn default() -> Self {
        Self {
            object: ObjectKind::KeyValue,
            operation: Operation::Put,
            placement: Placement::Shared,
            requests: crate::defaults::REQUESTS_PER_ITERATION,
            pin_workers: false,
        }
    }
}

/// Container plus the object opened inside it for one iteration.
pub(crate) struct Target {
    pub(crate) container: ContainerHandle,
    pub(crate) object: ObjectHandle,
}

/// Keys and the value payload for one iteration, generated up front so
/// the timed loop does no allocation beyond the requests themselves.
struct Payloads {
    keys: Vec<Vec<u8>>,
    value: Vec<u8>,
}

impl Payloads {
    fn generate(options: &WorkloadOptions, chunk_size: usize) -> Self {
        let keys = match options.object {
            ObjectKind::KeyValue => {
                let mut rng = rand::thread_rng();
                (0..options.requests)
                    // The index suffix keeps keys unique even if the
                    // random prefix collides.
                    .map(|i| format!("{:08x}-{i}", rng.gen::<u32>()).into_bytes())
                    .collect()
            }
            ObjectKind::Array => (0..options.requests)
                .map(|i| array_key(i as u64).to_vec())
                .collect(),
        };
        Self {
            keys,
            value: vec![b'A'; chunk_size],
        }
    }

    fn key(&self, index: usize) -> &[u8] {
        &self.keys[index % self.keys.len()]
    }
}

pub struct WorkloadDriver {
    store: Arc<dyn ObjectStore>,
    pool: PoolHandle,
    options: WorkloadOptions,
}

impl WorkloadDriver {
    pub fn new(store: Arc<dyn ObjectStore>, pool: PoolHandle, options: WorkloadOptions) -> Self {
        Self {
            store,
            pool,
            options,
        }
    }

    pub fn options(&self) -> &WorkloadOptions {
        &self.options
    }

    /// Run one timed iteration of `config`.
    ///
    /// Containers are created before the clock starts and removed after
    /// every worker has joined, on the failure path as well.
    pub fn run_iteration(&self, config: &TestConfiguration) -> Result<TimingSample> {
        if config.threads == 0 {
            return Err(Error::Config(
                "at least one worker thread is required".into(),
            ));
        }
        if self.options.requests == 0 {
            return Err(Error::Config("request count must be at least 1".into()));
        }

        let target_count = match self.options.placement {
            Placement::Shared => 1,
            Placement::PerWorker => config.threads,
        };
        let mut targets = Vec::with_capacity(target_count);
        for _ in 0..target_count {
            targets.push(self.open_target(config.chunk_size)?);
        }

        let outcome = self.run_workers(config, &targets);

        for target in &targets {
            if let Err(err) = self.store.remove_container(self.pool, target.container) {
                warn!("container teardown failed: {err}");
            }
        }
        outcome
    }

    /// Issue the configured requests against `targets` and time it.
    /// Worker `w` uses `targets[w % targets.len()]`.
    pub(crate) fn run_workers(
        &self,
        config: &TestConfiguration,
        targets: &[Target],
    ) -> Result<TimingSample> {
        let payloads = Payloads::generate(&self.options, config.chunk_size);

        // Get workloads read back data written outside the timed window.
        if self.options.operation == Operation::Get {
            for target in targets {
                self.seed(target, &payloads)?;
            }
        }

        let remaining = AtomicI64::new(self.options.requests as i64);
        let started = Instant::now();
        let mut reports: Vec<Result<Duration>> = Vec::with_capacity(config.threads);
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(config.threads);
            for worker in 0..config.threads {
                let target = &targets[worker % targets.len()];
                let remaining = &remaining;
                let payloads = &payloads;
                handles.push(scope.spawn(move || {
                    self.worker_loop(worker, target, payloads, remaining, config)
                }));
            }
            for handle in handles {
                reports.push(
                    handle
                        .join()
                        .unwrap_or(Err(Error::Store("worker thread panicked".into()))),
                );
            }
        });
        let duration = started.elapsed();

        let mut backpressure_wait = Duration::ZERO;
        let mut first_error = None;
        for report in reports {
            match report {
                Ok(wait) => backpressure_wait += wait,
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(TimingSample {
                duration,
                backpressure_wait,
            }),
        }
    }

    fn worker_loop(
        &self,
        worker: usize,
        target: &Target,
        payloads: &Payloads,
        remaining: &AtomicI64,
        config: &TestConfiguration,
    ) -> Result<Duration> {
        if self.options.pin_workers {
            pin_worker(worker);
        }
        let queue = if config.is_async() {
            Some(EventQueue::new(
                Arc::clone(&self.store),
                config.inflight_cap as usize,
            )?)
        } else {
            None
        };

        let total = self.options.requests as i64;
        loop {
            let previous = remaining.fetch_sub(1, Ordering::Relaxed);
            if previous <= 0 {
                break;
            }
            let index = (total - previous) as usize;
            self.issue_one(target, payloads, index, queue.as_ref())?;
        }

        match queue {
            Some(mut queue) => {
                queue.wait_all()?;
                let wait = queue.take_wait_time();
                queue.close()?;
                debug!(worker, ?wait, "worker drained");
                Ok(wait)
            }
            None => Ok(Duration::ZERO),
        }
    }

    fn issue_one(
        &self,
        target: &Target,
        payloads: &Payloads,
        index: usize,
        queue: Option<&EventQueue>,
    ) -> Result<()> {
        let slot = match queue {
            Some(queue) => Some(queue.get_slot()?.slot_ref()),
            None => None,
        };
        let key = payloads.key(index);
        match self.options.operation {
            Operation::Put => self.store.put(target.object, key, &payloads.value, slot),
            Operation::Get => {
                let buffer = Vec::with_capacity(payloads.value.len());
                self.store.get(target.object, key, buffer, slot).map(|_| ())
            }
        }
    }

    pub(crate) fn open_target(&self, chunk_size: usize) -> Result<Target> {
        let name = format!("bench-{}", Uuid::new_v4());
        let container = self.store.create_container(self.pool, Some(&name))?;
        let object = match self.options.object {
            ObjectKind::KeyValue => self.store.open_kv(container),
            ObjectKind::Array => self.store.open_array(
                container,
                chunk_size,
                chunk_size * crate::defaults::ARRAY_CHUNK_CELLS,
            ),
        };
        match object {
            Ok(object) => Ok(Target { container, object }),
            Err(err) => {
                let _ = self.store.remove_container(self.pool, container);
                Err(err)
            }
        }
    }

    fn seed(&self, target: &Target, payloads: &Payloads) -> Result<()> {
        for index in 0..self.options.requests {
            self.store
                .put(target.object, payloads.key(index), &payloads.value, None)?;
        }
        Ok(())
    }
}

fn pin_worker(worker: usize) {
    match core_affinity::get_core_ids() {
        Some(cores) if !cores.is_empty() => {
            let core = cores[worker % cores.len()];
            if !core_affinity::set_for_current(core) {
                debug!(worker, "could not pin worker to core");
            }
        }
        _ => debug!(worker, "no core ids available for pinning"),
    }
}
