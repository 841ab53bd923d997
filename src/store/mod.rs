//! Object store abstraction layer.
//!
//! The benchmark core consumes a small capability set from the storage
//! backend: pool connection, container lifecycle, key-value and array
//! objects, blocking or completion-queue-based put/get, and the completion
//! queue primitives themselves. `ObjectStore` captures exactly that set so
//! the driver and the admission queue are independent of any concrete
//! backend. `MemoryStore` is the in-process implementation the suite runs
//! and tests against.

use crate::error::Result;
use serde::{Deserialize, Serialize};

pub mod memory;

pub use memory::{MemoryOptions, MemoryStore};

/// Connected pool handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolHandle(pub(crate) u64);

/// Open container handle, scoped to a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle(pub(crate) u64);

/// Open object handle, scoped to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub(crate) u64);

/// Backend completion queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueHandle(pub(crate) u64);

/// Storage flavor of an object, chosen when the object is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    KeyValue,
    Array,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::KeyValue => write!(f, "key-value"),
            ObjectKind::Array => write!(f, "array"),
        }
    }
}

/// Position of one in-flight operation: the backend queue it will complete
/// on and the slot index the caller will recognize it by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub queue: QueueHandle,
    pub slot: usize,
}

/// One reaped completion. `error_code` is zero on success. For
/// asynchronous reads, the buffer that traveled with the request comes
/// back here, closing its ownership round-trip.
#[derive(Debug)]
pub struct Completion {
    pub slot: usize,
    pub error_code: i32,
    pub buffer: Option<Vec<u8>>,
}

/// Result of a `get` call. A synchronous get returns the filled buffer
/// immediately; an asynchronous one hands the buffer to the backend until
/// the completion is reaped.
#[derive(Debug)]
pub enum GetOutcome {
    Ready(Vec<u8>),
    Submitted,
}

/// Capability set the benchmark core requires from a storage backend.
///
/// Implementations must be safe to share across worker threads; handles
/// are plain ids and may be copied freely.
pub trait ObjectStore: Send + Sync {
    /// Connect to a pool by label or id.
    fn connect(&self, label: &str) -> Result<PoolHandle>;

    /// Release a pool connection.
    fn disconnect(&self, pool: PoolHandle) -> Result<()>;

    /// Create (and open) a container, optionally with a label.
    fn create_container(&self, pool: PoolHandle, name: Option<&str>) -> Result<ContainerHandle>;

    /// Destroy a container and every object in it.
    fn remove_container(&self, pool: PoolHandle, container: ContainerHandle) -> Result<()>;

    /// Open a key-value object in the container.
    fn open_kv(&self, container: ContainerHandle) -> Result<ObjectHandle>;

    /// Open an array object with the given cell and chunk geometry.
    fn open_array(
        &self,
        container: ContainerHandle,
        cell_size: usize,
        chunk_size: usize,
    ) -> Result<ObjectHandle>;

    /// Write a value. Blocks until applied when `slot` is `None`;
    /// otherwise returns once submitted and completes on the slot's queue.
    fn put(
        &self,
        object: ObjectHandle,
        key: &[u8],
        value: &[u8],
        slot: Option<SlotRef>,
    ) -> Result<()>;

    /// Read a value into `buffer`. The buffer is owned by the request
    /// until the operation finishes: synchronously it comes back in
    /// `GetOutcome::Ready`, asynchronously in the reaped [`Completion`].
    fn get(
        &self,
        object: ObjectHandle,
        key: &[u8],
        buffer: Vec<u8>,
        slot: Option<SlotRef>,
    ) -> Result<GetOutcome>;

    /// Create a completion queue.
    fn create_queue(&self) -> Result<QueueHandle>;

    /// Reap at most one completion. `None` means nothing has completed
    /// and either `blocking` was false or the queue has no outstanding
    /// operations at all.
    fn poll_queue(&self, queue: QueueHandle, blocking: bool) -> Result<Option<Completion>>;

    /// Destroy a completion queue. Fails with [`crate::Error::Busy`]
    /// while submitted operations have not been reaped yet.
    fn destroy_queue(&self, queue: QueueHandle) -> Result<()>;
}

/// Key encoding for array cells. Array objects address cells by index;
/// the uniform put/get interface carries that index as a fixed-width key.
pub fn array_key(index: u64) -> [u8; 8] {
    index.to_le_bytes()
}
