//! Bounded admission over a backend completion queue.
//!
//! An [`EventQueue`] owns a fixed pool of completion slots bound to one
//! backend queue. Callers obtain a slot with [`EventQueue::get_slot`],
//! attach it to an asynchronous put or get, and the queue reaps the
//! completion later. Once all slots are handed out, admission blocks until
//! a completion is reaped, which caps the number of concurrent outstanding
//! operations at the queue's capacity. That blocking is the backpressure
//! mechanism, and the time spent inside it is tracked separately so a
//! measurement can distinguish throughput from waiting.
//!
//! One queue may be shared across threads: the slot table sits behind a
//! mutex, so concurrent callers are serialized with respect to slot
//! assignment and the active count. Which thread reaps which completion is
//! a race by design; a given slot is only ever handed to one caller at a
//! time. Completion order carries no relation to submission order.

use crate::error::{Error, Result};
use crate::store::{Completion, ObjectStore, QueueHandle, SlotRef};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Attempts to destroy the backend queue before giving up.
const DESTROY_RETRY_LIMIT: u32 = 20;
/// Base delay between destroy attempts, scaled linearly per attempt.
const DESTROY_RETRY_BACKOFF: Duration = Duration::from_millis(5);
/// Re-poll interval for the window where a slot has been admitted but its
/// operation has not reached the backend yet.
const SUBMISSION_GRACE: Duration = Duration::from_micros(100);

/// Completion token for one in-flight operation. Obtained from
/// [`EventQueue::get_slot`], consumed by passing [`Event::slot_ref`] to an
/// asynchronous store operation.
#[derive(Debug)]
pub struct Event {
    queue: QueueHandle,
    slot: usize,
}

impl Event {
    pub fn slot_ref(&self) -> SlotRef {
        SlotRef {
            queue: self.queue,
            slot: self.slot,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// A completion pulled out of the queue by [`EventQueue::poll_one`]. For
/// asynchronous reads the buffer that traveled with the request comes back
/// here.
#[derive(Debug)]
pub struct Reaped {
    pub slot: usize,
    pub buffer: Option<Vec<u8>>,
}

struct SlotTable {
    /// Distinct slot identities created so far. Never exceeds capacity,
    /// never shrinks.
    allocated: usize,
    /// Slots currently admitted and not yet reaped.
    active: usize,
    /// Reaped slots available for reuse.
    free: Vec<usize>,
}

/// Fixed-capacity admission queue over one backend completion queue.
///
/// Slots are populated lazily up to the capacity and reused afterwards.
/// The queue must be drained before destruction; [`EventQueue::close`]
/// does both and `Drop` falls back to a best-effort close.
pub struct EventQueue {
    store: Arc<dyn ObjectStore>,
    queue: QueueHandle,
    capacity: usize,
    slots: Mutex<SlotTable>,
    /// Nanoseconds spent blocked reaping, cumulative since the last
    /// [`EventQueue::take_wait_time`].
    wait_ns: AtomicU64,
    closed: bool,
}

impl EventQueue {
    /// Create a queue admitting at most `capacity` concurrent operations.
    pub fn new(store: Arc<dyn ObjectStore>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config(
                "completion queue capacity must be at least 1".into(),
            ));
        }
        let queue = store.create_queue()?;
        Ok(Self {
            store,
            queue,
            capacity,
            slots: Mutex::new(SlotTable {
                allocated: 0,
                active: 0,
                free: Vec::with_capacity(capacity),
            }),
            wait_ns: AtomicU64::new(0),
            closed: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently admitted and not yet reaped.
    pub fn active(&self) -> usize {
        self.slots.lock().active
    }

    pub fn handle(&self) -> QueueHandle {
        self.queue
    }

    /// Obtain a completion slot.
    ///
    /// Below capacity this allocates (or reuses) a slot without blocking.
    /// At capacity it blocks until exactly one outstanding operation
    /// completes and re-arms that operation's slot for the caller. A
    /// completion carrying a nonzero backend code surfaces as
    /// [`Error::Completion`]; the slot is reclaimed either way, so the
    /// error never leaks into a later use of the same slot.
    pub fn get_slot(&self) -> Result<Event> {
        loop {
            {
                let mut slots = self.slots.lock();
                if let Some(slot) = slots.free.pop() {
                    slots.active += 1;
                    return Ok(self.event(slot));
                }
                if slots.allocated < self.capacity {
                    let slot = slots.allocated;
                    slots.allocated += 1;
                    slots.active += 1;
                    trace!(slot, "slot populated");
                    return Ok(self.event(slot));
                }
            }

            // Full: one operation has to retire before another is
            // admitted.
            match self.reap(true)? {
                Some(completion) => {
                    if completion.error_code != 0 {
                        let mut slots = self.slots.lock();
                        slots.active -= 1;
                        slots.free.push(completion.slot);
                        return Err(Error::Completion {
                            code: completion.error_code,
                        });
                    }
                    // The retired operation's slot is handed straight to
                    // the caller, so the active count is unchanged.
                    return Ok(self.event(completion.slot));
                }
                // Either a submitter still holds an admitted slot whose
                // operation has not reached the backend, or another
                // thread reaped the completion first and freed a slot;
                // the next pass of the loop picks either up.
                None => std::thread::sleep(SUBMISSION_GRACE),
            }
        }
    }

    /// Reap a single completion.
    ///
    /// Returns `Ok(None)` when nothing has completed and either
    /// `blocking` is false or the queue is fully idle. On success the
    /// slot returns to the free list. A nonzero backend code surfaces as
    /// [`Error::Completion`] with the slot reclaimed all the same.
    pub fn poll_one(&self, blocking: bool) -> Result<Option<Reaped>> {
        if self.slots.lock().active == 0 {
            return Ok(None);
        }
        let completion = match self.reap(blocking)? {
            Some(completion) => completion,
            None => return Ok(None),
        };
        let mut slots = self.slots.lock();
        slots.active -= 1;
        slots.free.push(completion.slot);
        if completion.error_code != 0 {
            return Err(Error::Completion {
                code: completion.error_code,
            });
        }
        Ok(Some(Reaped {
            slot: completion.slot,
            buffer: completion.buffer,
        }))
    }

    /// Block until every admitted operation has been reaped.
    ///
    /// The first completion error encountered is returned; remaining
    /// operations stay outstanding and a subsequent call keeps draining.
    /// Idempotent on an empty queue. There is no deadline: a backend that
    /// never completes an operation blocks this forever.
    pub fn wait_all(&self) -> Result<()> {
        loop {
            if self.slots.lock().active == 0 {
                return Ok(());
            }
            match self.reap(true)? {
                Some(completion) => {
                    let mut slots = self.slots.lock();
                    slots.active -= 1;
                    slots.free.push(completion.slot);
                    if completion.error_code != 0 {
                        return Err(Error::Completion {
                            code: completion.error_code,
                        });
                    }
                }
                // A slot was admitted but its operation has not reached
                // the backend yet. Give the submitter a moment.
                None => std::thread::sleep(SUBMISSION_GRACE),
            }
        }
    }

    /// Cumulative time spent blocked reaping since the last call. Reads
    /// and resets the counter.
    pub fn take_wait_time(&self) -> Duration {
        Duration::from_nanos(self.wait_ns.swap(0, Ordering::Relaxed))
    }

    /// Drain the queue and destroy the backend resource.
    ///
    /// Completion errors found while draining are logged and do not block
    /// the teardown. A backend still reporting busy after the bounded
    /// retry budget turns into [`Error::Timeout`] instead of looping
    /// forever. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        loop {
            match self.wait_all() {
                Ok(()) => break,
                Err(err @ Error::Completion { .. }) => {
                    warn!("completion error while draining queue: {err}")
                }
                Err(err) => return Err(err),
            }
        }
        for attempt in 1..=DESTROY_RETRY_LIMIT {
            match self.store.destroy_queue(self.queue) {
                Ok(()) => {
                    self.closed = true;
                    return Ok(());
                }
                Err(Error::Busy) => {
                    trace!(attempt, "completion queue still busy");
                    std::thread::sleep(DESTROY_RETRY_BACKOFF * attempt);
                }
                Err(err) => return Err(err),
            }
        }
        // The backend resource is abandoned once the budget runs out;
        // retrying from Drop would only stall teardown again.
        self.closed = true;
        Err(Error::Timeout(format!(
            "completion queue still busy after {DESTROY_RETRY_LIMIT} destroy attempts"
        )))
    }

    fn event(&self, slot: usize) -> Event {
        Event {
            queue: self.queue,
            slot,
        }
    }

    /// Poll the backend once, accounting blocked time.
    fn reap(&self, blocking: bool) -> Result<Option<Completion>> {
        let started = Instant::now();
        let polled = self.store.poll_queue(self.queue, blocking);
        self.wait_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        polled
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                warn!("failed to close completion queue: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryOptions, MemoryStore, CODE_INJECTED_FAULT};
    use crate::store::{ContainerHandle, ObjectHandle, PoolHandle};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        pool: PoolHandle,
        container: ContainerHandle,
        object: ObjectHandle,
    }

    fn fixture(options: MemoryOptions) -> Fixture {
        let store = Arc::new(MemoryStore::with_options(options));
        let pool = store.connect("queue-tests").unwrap();
        let container = store.create_container(pool, None).unwrap();
        let object = store.open_kv(container).unwrap();
        Fixture {
            store,
            pool,
            container,
            object,
        }
    }

    fn put_async(f: &Fixture, queue: &EventQueue, key: &str) -> crate::error::Result<()> {
        let event = queue.get_slot()?;
        f.store
            .put(f.object, key.as_bytes(), b"value", Some(event.slot_ref()))
    }

    #[test]
    fn capacity_bounds_distinct_slots_and_outstanding_ops() {
        let f = fixture(MemoryOptions::default());
        let store: Arc<dyn ObjectStore> = f.store.clone();
        let mut queue = EventQueue::new(store, 4).unwrap();

        for i in 0..64 {
            put_async(&f, &queue, &format!("k{i}")).unwrap();
            assert!(queue.active() <= 4);
        }
        queue.wait_all().unwrap();
        assert_eq!(queue.active(), 0);

        // No more than 4 slot identities ever existed, and the backend
        // never saw more than 4 operations outstanding at once.
        assert!(f.store.queue_high_water(queue.handle()).unwrap() <= 4);
        queue.close().unwrap();
    }

    #[test]
    fn zero_capacity_is_a_configuration_error() {
        let f = fixture(MemoryOptions::default());
        let store: Arc<dyn ObjectStore> = f.store.clone();
        assert!(matches!(
            EventQueue::new(store, 0),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn wait_all_is_idempotent_on_an_empty_queue() {
        let f = fixture(MemoryOptions::default());
        let store: Arc<dyn ObjectStore> = f.store.clone();
        let queue = EventQueue::new(store, 2).unwrap();
        queue.wait_all().unwrap();
        queue.wait_all().unwrap();
        assert!(queue.poll_one(true).unwrap().is_none());
    }

    #[test]
    fn third_admission_blocks_until_first_completion() {
        let delay = Duration::from_millis(40);
        let f = fixture(MemoryOptions {
            completion_delay: delay,
            ..MemoryOptions::default()
        });
        let store: Arc<dyn ObjectStore> = f.store.clone();
        let mut queue = EventQueue::new(store, 2).unwrap();

        let started = Instant::now();
        for i in 0..5 {
            put_async(&f, &queue, &format!("k{i}")).unwrap();
            if i < 2 {
                // The first two admissions must not block.
                assert!(started.elapsed() < delay / 2, "admission {i} blocked");
            }
        }
        // The third admission could only proceed once request 1 retired.
        assert!(started.elapsed() >= delay);
        queue.wait_all().unwrap();
        assert!(queue.take_wait_time() > Duration::ZERO);
        queue.close().unwrap();
    }

    #[test]
    fn completion_error_reclaims_slot_without_staining_it() {
        let f = fixture(MemoryOptions {
            completion_delay: Duration::ZERO,
            fault_key_prefix: Some((b"poison".to_vec(), CODE_INJECTED_FAULT)),
        });
        let store: Arc<dyn ObjectStore> = f.store.clone();
        let mut queue = EventQueue::new(store, 1).unwrap();

        put_async(&f, &queue, "poison-1").unwrap();
        match queue.poll_one(true) {
            Err(Error::Completion { code }) => assert_eq!(code, CODE_INJECTED_FAULT),
            other => panic!("expected completion error, got {other:?}"),
        }

        // The reclaimed slot works again and reports no stale error.
        put_async(&f, &queue, "clean-1").unwrap();
        let reaped = queue.poll_one(true).unwrap().unwrap();
        assert_eq!(reaped.slot, 0);
        queue.wait_all().unwrap();
        queue.close().unwrap();
    }

    #[test]
    fn admission_at_capacity_surfaces_the_reaped_error() {
        let f = fixture(MemoryOptions {
            completion_delay: Duration::ZERO,
            fault_key_prefix: Some((b"poison".to_vec(), CODE_INJECTED_FAULT)),
        });
        let store: Arc<dyn ObjectStore> = f.store.clone();
        let mut queue = EventQueue::new(store, 1).unwrap();

        put_async(&f, &queue, "poison-1").unwrap();
        // Queue is full, so this admission must reap, and what it reaps
        // carries the injected fault.
        match queue.get_slot() {
            Err(Error::Completion { code }) => assert_eq!(code, CODE_INJECTED_FAULT),
            other => panic!("expected completion error, got {other:?}"),
        }
        assert_eq!(queue.active(), 0);
        queue.close().unwrap();
    }

    #[test]
    fn close_drains_and_is_idempotent() {
        let f = fixture(MemoryOptions {
            completion_delay: Duration::from_millis(5),
            ..MemoryOptions::default()
        });
        let store: Arc<dyn ObjectStore> = f.store.clone();
        let mut queue = EventQueue::new(store, 3).unwrap();
        for i in 0..6 {
            put_async(&f, &queue, &format!("k{i}")).unwrap();
        }
        queue.close().unwrap();
        queue.close().unwrap();
        assert_eq!(f.store.object_len(f.object), Some(6));
        f.store.remove_container(f.pool, f.container).unwrap();
    }

    /// Store wrapper whose queue destruction reports busy a fixed number
    /// of times before succeeding.
    struct FlakyDestroy {
        inner: MemoryStore,
        busy_left: std::sync::atomic::AtomicU32,
    }

    impl FlakyDestroy {
        fn new(busy_count: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                busy_left: std::sync::atomic::AtomicU32::new(busy_count),
            }
        }
    }

    impl ObjectStore for FlakyDestroy {
        fn connect(&self, label: &str) -> crate::error::Result<crate::store::PoolHandle> {
            self.inner.connect(label)
        }
        fn disconnect(&self, pool: crate::store::PoolHandle) -> crate::error::Result<()> {
            self.inner.disconnect(pool)
        }
        fn create_container(
            &self,
            pool: crate::store::PoolHandle,
            name: Option<&str>,
        ) -> crate::error::Result<ContainerHandle> {
            self.inner.create_container(pool, name)
        }
        fn remove_container(
            &self,
            pool: crate::store::PoolHandle,
            container: ContainerHandle,
        ) -> crate::error::Result<()> {
            self.inner.remove_container(pool, container)
        }
        fn open_kv(&self, container: ContainerHandle) -> crate::error::Result<ObjectHandle> {
            self.inner.open_kv(container)
        }
        fn open_array(
            &self,
            container: ContainerHandle,
            cell_size: usize,
            chunk_size: usize,
        ) -> crate::error::Result<ObjectHandle> {
            self.inner.open_array(container, cell_size, chunk_size)
        }
        fn put(
            &self,
            object: ObjectHandle,
            key: &[u8],
            value: &[u8],
            slot: Option<SlotRef>,
        ) -> crate::error::Result<()> {
            self.inner.put(object, key, value, slot)
        }
        fn get(
            &self,
            object: ObjectHandle,
            key: &[u8],
            buffer: Vec<u8>,
            slot: Option<SlotRef>,
        ) -> crate::error::Result<crate::store::GetOutcome> {
            self.inner.get(object, key, buffer, slot)
        }
        fn create_queue(&self) -> crate::error::Result<QueueHandle> {
            self.inner.create_queue()
        }
        fn poll_queue(
            &self,
            queue: QueueHandle,
            blocking: bool,
        ) -> crate::error::Result<Option<Completion>> {
            self.inner.poll_queue(queue, blocking)
        }
        fn destroy_queue(&self, queue: QueueHandle) -> crate::error::Result<()> {
            use std::sync::atomic::Ordering;
            if self
                .busy_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                return Err(Error::Busy);
            }
            self.inner.destroy_queue(queue)
        }
    }

    #[test]
    fn close_retries_through_transient_busy() {
        let store: Arc<dyn ObjectStore> = Arc::new(FlakyDestroy::new(3));
        let mut queue = EventQueue::new(store, 2).unwrap();
        queue.close().unwrap();
    }

    #[test]
    fn close_times_out_when_busy_never_clears() {
        let store: Arc<dyn ObjectStore> = Arc::new(FlakyDestroy::new(u32::MAX));
        let mut queue = EventQueue::new(store, 2).unwrap();
        match queue.close() {
            Err(Error::Timeout(_)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        // Drop must not loop on the same busy queue again.
        drop(queue);
    }

    #[test]
    fn async_get_buffer_comes_back_on_reap() {
        let f = fixture(MemoryOptions::default());
        f.store.put(f.object, b"k", b"stored-bytes", None).unwrap();
        let store: Arc<dyn ObjectStore> = f.store.clone();
        let mut queue = EventQueue::new(store, 2).unwrap();

        let event = queue.get_slot().unwrap();
        f.store
            .get(f.object, b"k", Vec::new(), Some(event.slot_ref()))
            .unwrap();
        let reaped = queue.poll_one(true).unwrap().unwrap();
        assert_eq!(reaped.buffer.as_deref(), Some(&b"stored-bytes"[..]));
        queue.close().unwrap();
    }
}
