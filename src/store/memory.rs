//! In-process object store backend.
//!
//! `MemoryStore` keeps containers and objects in a mutexed table and
//! services asynchronous operations on a dedicated completion worker
//! thread. Completions are delivered per queue in submission order, each
//! after a configurable service latency, which makes admission behavior
//! deterministic enough to assert on. The store also counts every queue it
//! creates and tracks the outstanding high-water mark per queue; the
//! harness and the test suite use both as observability hooks.

use crate::error::{Error, Result};
use crate::store::{
    Completion, ContainerHandle, GetOutcome, ObjectHandle, ObjectKind, ObjectStore, PoolHandle,
    QueueHandle, SlotRef,
};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace};

/// Backend code for a read of a key that was never written.
pub const CODE_NO_SUCH_KEY: i32 = 2;
/// Backend code reported for operations matched by fault injection.
pub const CODE_INJECTED_FAULT: i32 = 5;
/// Backend code for a write larger than an array object's cell.
pub const CODE_CELL_OVERFLOW: i32 = 27;

/// Construction options for [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryOptions {
    /// Service latency applied to every operation, synchronous or not.
    pub completion_delay: Duration,
    /// Fail any operation whose key starts with this prefix, reporting
    /// the paired backend code.
    pub fault_key_prefix: Option<(Vec<u8>, i32)>,
}

struct ObjectState {
    kind: ObjectKind,
    cell_size: usize,
    chunk_size: usize,
    entries: HashMap<Vec<u8>, Vec<u8>>,
}

struct ContainerState {
    pool: u64,
    label: Option<String>,
    objects: Vec<u64>,
}

#[derive(Default)]
struct Tables {
    pools: HashMap<u64, String>,
    containers: HashMap<u64, ContainerState>,
    objects: HashMap<u64, ObjectState>,
}

struct QueueState {
    completed: Mutex<VecDeque<Completion>>,
    cond: Condvar,
    /// Submitted and not yet reaped. Guards destruction.
    outstanding: AtomicUsize,
    high_water: AtomicUsize,
}

enum AsyncOp {
    Put {
        object: u64,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Get {
        object: u64,
        key: Vec<u8>,
        buffer: Vec<u8>,
    },
}

enum Job {
    Op { queue: u64, slot: usize, op: AsyncOp },
    Shutdown,
}

struct Inner {
    tables: Mutex<Tables>,
    queues: Mutex<HashMap<u64, Arc<QueueState>>>,
    options: MemoryOptions,
}

pub struct MemoryStore {
    inner: Arc<Inner>,
    jobs: Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    queues_created: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_options(MemoryOptions::default())
    }

    /// Store whose every operation takes `delay` to complete.
    pub fn with_delay(delay: Duration) -> Self {
        Self::with_options(MemoryOptions {
            completion_delay: delay,
            ..MemoryOptions::default()
        })
    }

    pub fn with_options(options: MemoryOptions) -> Self {
        let inner = Arc::new(Inner {
            tables: Mutex::new(Tables::default()),
            queues: Mutex::new(HashMap::new()),
            options,
        });
        let (jobs, receiver) = unbounded();
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("memstore-completion".into())
            .spawn(move || completion_worker(worker_inner, receiver))
            .expect("failed to spawn completion worker thread");
        Self {
            inner,
            jobs,
            worker: Mutex::new(Some(worker)),
            next_id: AtomicU64::new(1),
            queues_created: AtomicU64::new(0),
        }
    }

    /// Total completion queues created over the store's lifetime.
    pub fn queues_created(&self) -> u64 {
        self.queues_created.load(Ordering::Relaxed)
    }

    /// Highest number of simultaneously outstanding operations observed
    /// on `queue`, or `None` if the queue is unknown (or destroyed).
    pub fn queue_high_water(&self, queue: QueueHandle) -> Option<usize> {
        self.inner
            .queues
            .lock()
            .get(&queue.0)
            .map(|q| q.high_water.load(Ordering::Relaxed))
    }

    /// Number of entries currently stored in `object`.
    pub fn object_len(&self, object: ObjectHandle) -> Option<usize> {
        self.inner
            .tables
            .lock()
            .objects
            .get(&object.0)
            .map(|o| o.entries.len())
    }

    /// Containers currently alive in the store.
    pub fn containers_live(&self) -> usize {
        self.inner.tables.lock().containers.len()
    }

    /// Cell and chunk sizes of an array object.
    pub fn array_geometry(&self, object: ObjectHandle) -> Option<(usize, usize)> {
        self.inner
            .tables
            .lock()
            .objects
            .get(&object.0)
            .filter(|o| o.kind == ObjectKind::Array)
            .map(|o| (o.cell_size, o.chunk_size))
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn queue_state(&self, queue: QueueHandle) -> Result<Arc<QueueState>> {
        self.inner
            .queues
            .lock()
            .get(&queue.0)
            .cloned()
            .ok_or(Error::NotFound("completion queue"))
    }

    fn submit(&self, slot: SlotRef, op: AsyncOp) -> Result<()> {
        let queue = self.queue_state(slot.queue)?;
        let outstanding = queue.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        queue.high_water.fetch_max(outstanding, Ordering::Relaxed);
        self.jobs
            .send(Job::Op {
                queue: slot.queue.0,
                slot: slot.slot,
                op,
            })
            .map_err(|_| Error::Store("completion worker is gone".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn completion_worker(inner: Arc<Inner>, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Shutdown => break,
            Job::Op { queue, slot, op } => {
                if !inner.options.completion_delay.is_zero() {
                    std::thread::sleep(inner.options.completion_delay);
                }
                let (error_code, buffer) = apply(&inner, op);
                let state = inner.queues.lock().get(&queue).cloned();
                match state {
                    Some(state) => {
                        let mut completed = state.completed.lock();
                        completed.push_back(Completion {
                            slot,
                            error_code,
                            buffer,
                        });
                        state.cond.notify_all();
                    }
                    // Destruction refuses queues with outstanding work,
                    // so this only happens if the submitter gave up.
                    None => debug!(queue, slot, "completion for destroyed queue dropped"),
                }
            }
        }
    }
    trace!("completion worker exiting");
}

fn apply(inner: &Inner, op: AsyncOp) -> (i32, Option<Vec<u8>>) {
    match op {
        AsyncOp::Put { object, key, value } => {
            if let Some(code) = injected_fault(inner, &key) {
                return (code, None);
            }
            let mut tables = inner.tables.lock();
            match tables.objects.get_mut(&object) {
                Some(state) => {
                    if state.kind == ObjectKind::Array && value.len() > state.cell_size {
                        return (CODE_CELL_OVERFLOW, None);
                    }
                    state.entries.insert(key, value);
                    (0, None)
                }
                None => (CODE_NO_SUCH_KEY, None),
            }
        }
        AsyncOp::Get {
            object,
            key,
            mut buffer,
        } => {
            if let Some(code) = injected_fault(inner, &key) {
                return (code, Some(buffer));
            }
            let tables = inner.tables.lock();
            match tables.objects.get(&object).and_then(|o| o.entries.get(&key)) {
                Some(value) => {
                    buffer.clear();
                    buffer.extend_from_slice(value);
                    (0, Some(buffer))
                }
                None => (CODE_NO_SUCH_KEY, Some(buffer)),
            }
        }
    }
}

fn injected_fault(inner: &Inner, key: &[u8]) -> Option<i32> {
    match &inner.options.fault_key_prefix {
        Some((prefix, code)) if key.starts_with(prefix) => Some(*code),
        _ => None,
    }
}

impl ObjectStore for MemoryStore {
    fn connect(&self, label: &str) -> Result<PoolHandle> {
        if label.is_empty() {
            return Err(Error::Connection("empty pool label".into()));
        }
        let id = self.allocate_id();
        self.inner.tables.lock().pools.insert(id, label.to_string());
        debug!(pool = id, label, "pool connected");
        Ok(PoolHandle(id))
    }

    fn disconnect(&self, pool: PoolHandle) -> Result<()> {
        self.inner
            .tables
            .lock()
            .pools
            .remove(&pool.0)
            .map(|_| ())
            .ok_or(Error::NotFound("pool"))
    }

    fn create_container(&self, pool: PoolHandle, name: Option<&str>) -> Result<ContainerHandle> {
        let mut tables = self.inner.tables.lock();
        if !tables.pools.contains_key(&pool.0) {
            return Err(Error::Connection("pool handle is not connected".into()));
        }
        let id = self.allocate_id();
        tables.containers.insert(
            id,
            ContainerState {
                pool: pool.0,
                label: name.map(str::to_string),
                objects: Vec::new(),
            },
        );
        trace!(container = id, label = ?name, "container created");
        Ok(ContainerHandle(id))
    }

    fn remove_container(&self, pool: PoolHandle, container: ContainerHandle) -> Result<()> {
        let mut tables = self.inner.tables.lock();
        let state = tables
            .containers
            .remove(&container.0)
            .ok_or(Error::NotFound("container"))?;
        if state.pool != pool.0 {
            // Put it back rather than destroy someone else's container.
            tables.containers.insert(container.0, state);
            return Err(Error::Store("container belongs to a different pool".into()));
        }
        trace!(container = container.0, label = ?state.label, "container removed");
        for object in state.objects {
            tables.objects.remove(&object);
        }
        Ok(())
    }

    fn open_kv(&self, container: ContainerHandle) -> Result<ObjectHandle> {
        self.open_object(container, ObjectKind::KeyValue, 0, 0)
    }

    fn open_array(
        &self,
        container: ContainerHandle,
        cell_size: usize,
        chunk_size: usize,
    ) -> Result<ObjectHandle> {
        if cell_size == 0 || chunk_size == 0 {
            return Err(Error::Store("array geometry must be nonzero".into()));
        }
        self.open_object(container, ObjectKind::Array, cell_size, chunk_size)
    }

    fn put(
        &self,
        object: ObjectHandle,
        key: &[u8],
        value: &[u8],
        slot: Option<SlotRef>,
    ) -> Result<()> {
        match slot {
            Some(slot) => self.submit(
                slot,
                AsyncOp::Put {
                    object: object.0,
                    key: key.to_vec(),
                    value: value.to_vec(),
                },
            ),
            None => {
                if !self.inner.options.completion_delay.is_zero() {
                    std::thread::sleep(self.inner.options.completion_delay);
                }
                let (code, _) = apply(
                    &self.inner,
                    AsyncOp::Put {
                        object: object.0,
                        key: key.to_vec(),
                        value: value.to_vec(),
                    },
                );
                match code {
                    0 => Ok(()),
                    code => Err(Error::Store(format!("put failed with backend code {code}"))),
                }
            }
        }
    }

    fn get(
        &self,
        object: ObjectHandle,
        key: &[u8],
        buffer: Vec<u8>,
        slot: Option<SlotRef>,
    ) -> Result<GetOutcome> {
        match slot {
            Some(slot) => {
                self.submit(
                    slot,
                    AsyncOp::Get {
                        object: object.0,
                        key: key.to_vec(),
                        buffer,
                    },
                )?;
                Ok(GetOutcome::Submitted)
            }
            None => {
                if !self.inner.options.completion_delay.is_zero() {
                    std::thread::sleep(self.inner.options.completion_delay);
                }
                let (code, filled) = apply(
                    &self.inner,
                    AsyncOp::Get {
                        object: object.0,
                        key: key.to_vec(),
                        buffer,
                    },
                );
                match code {
                    0 => Ok(GetOutcome::Ready(filled.unwrap_or_default())),
                    CODE_NO_SUCH_KEY => Err(Error::NotFound("key")),
                    code => Err(Error::Store(format!("get failed with backend code {code}"))),
                }
            }
        }
    }

    fn create_queue(&self) -> Result<QueueHandle> {
        let id = self.allocate_id();
        self.inner.queues.lock().insert(
            id,
            Arc::new(QueueState {
                completed: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                outstanding: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
            }),
        );
        self.queues_created.fetch_add(1, Ordering::Relaxed);
        trace!(queue = id, "completion queue created");
        Ok(QueueHandle(id))
    }

    fn poll_queue(&self, queue: QueueHandle, blocking: bool) -> Result<Option<Completion>> {
        let state = self.queue_state(queue)?;
        let mut completed = state.completed.lock();
        loop {
            if let Some(completion) = completed.pop_front() {
                state.outstanding.fetch_sub(1, Ordering::SeqCst);
                return Ok(Some(completion));
            }
            if !blocking || state.outstanding.load(Ordering::SeqCst) == 0 {
                return Ok(None);
            }
            state.cond.wait(&mut completed);
        }
    }

    fn destroy_queue(&self, queue: QueueHandle) -> Result<()> {
        let mut queues = self.inner.queues.lock();
        {
            let state = queues
                .get(&queue.0)
                .ok_or(Error::NotFound("completion queue"))?;
            if state.outstanding.load(Ordering::SeqCst) > 0 {
                return Err(Error::Busy);
            }
        }
        queues.remove(&queue.0);
        Ok(())
    }
}

impl MemoryStore {
    fn open_object(
        &self,
        container: ContainerHandle,
        kind: ObjectKind,
        cell_size: usize,
        chunk_size: usize,
    ) -> Result<ObjectHandle> {
        let mut tables = self.inner.tables.lock();
        if !tables.containers.contains_key(&container.0) {
            return Err(Error::NotFound("container"));
        }
        let id = self.allocate_id();
        trace!(object = id, %kind, cell_size, chunk_size, "object opened");
        tables.objects.insert(
            id,
            ObjectState {
                kind,
                cell_size,
                chunk_size,
                entries: HashMap::new(),
            },
        );
        if let Some(container) = tables.containers.get_mut(&container.0) {
            container.objects.push(id);
        }
        Ok(ObjectHandle(id))
    }
}
