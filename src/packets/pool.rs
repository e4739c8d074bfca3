use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;

/// Number of buffers a pool holds when no capacity is given.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// What [`Pool::get`] does when every slot is checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// Suspend the caller until a buffer is returned.
    #[default]
    Block,
    /// Hand out a transient heap buffer that is discarded on return.
    Allocate,
}

#[derive(Debug)]
enum Slot {
    Free(Box<[u8]>),
    CheckedOut,
}

#[derive(Debug)]
struct Slots {
    states: Vec<Slot>,
    free: Vec<usize>,
}

#[derive(Debug)]
struct Shared {
    buffer_size: usize,
    policy: ExhaustionPolicy,
    slots: Mutex<Slots>,
    available: Semaphore,
    in_flight: AtomicUsize,
    checkouts: AtomicU64,
    returns: AtomicU64,
    transient: AtomicU64,
}

/// A fixed-capacity pool of datagram-sized buffers.
///
/// A slot is either free or owned by exactly one [`Buffer`]. Handles are cheap to clone and
/// every clone refers to the same set of slots.
#[derive(Debug, Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub buffer_size: usize,
    pub in_flight: usize,
    pub checkouts: u64,
    pub returns: u64,
    pub transient_allocations: u64,
}

impl Pool {
    /// Creates a blocking pool of [`DEFAULT_POOL_CAPACITY`] buffers of `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Self {
        Self::with_options(buffer_size, DEFAULT_POOL_CAPACITY, ExhaustionPolicy::default())
    }

    /// Creates a pool with an explicit capacity and exhaustion policy.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` or `capacity` is zero.
    pub fn with_options(buffer_size: usize, capacity: usize, policy: ExhaustionPolicy) -> Self {
        assert!(buffer_size > 0, "buffer size must be greater than zero");
        assert!(capacity > 0, "pool capacity must be greater than zero");

        let states = (0..capacity)
            .map(|_| Slot::Free(vec![0u8; buffer_size].into_boxed_slice()))
            .collect();
        // Popping from the back hands out slot 0 first.
        let free = (0..capacity).rev().collect();

        Self {
            shared: Arc::new(Shared {
                buffer_size,
                policy,
                slots: Mutex::new(Slots { states, free }),
                available: Semaphore::new(capacity),
                in_flight: AtomicUsize::new(0),
                checkouts: AtomicU64::new(0),
                returns: AtomicU64::new(0),
                transient: AtomicU64::new(0),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.lock_slots().states.len()
    }

    pub fn policy(&self) -> ExhaustionPolicy {
        self.shared.policy
    }

    /// Checks out an empty buffer.
    ///
    /// Under [`ExhaustionPolicy::Block`] this waits until another holder returns a buffer.
    /// Under [`ExhaustionPolicy::Allocate`] it falls back to a transient allocation.
    pub async fn get(&self) -> Buffer {
        match self.shared.policy {
            ExhaustionPolicy::Block => {
                self.shared
                    .available
                    .acquire()
                    .await
                    .expect("pool semaphore is never closed")
                    .forget();
                self.checkout_slot()
            }
            ExhaustionPolicy::Allocate => self.try_checkout().unwrap_or_else(|| self.transient()),
        }
    }

    /// Checks out a buffer without waiting.
    ///
    /// Returns `None` only for a blocking pool with no free slot.
    pub fn try_get(&self) -> Option<Buffer> {
        match self.shared.policy {
            ExhaustionPolicy::Block => self.try_checkout(),
            ExhaustionPolicy::Allocate => Some(self.try_checkout().unwrap_or_else(|| self.transient())),
        }
    }

    /// Returns a buffer to the pool it was taken from.
    ///
    /// Dropping a [`Buffer`] has the same effect; this variant additionally verifies that the
    /// buffer belongs to this pool.
    pub fn put(&self, buffer: Buffer) {
        if !Arc::ptr_eq(&self.shared, &buffer.pool.shared) {
            log::error!("Buffer returned to a pool it was not taken from");
            debug_assert!(false, "buffer returned to a foreign pool");
        }
        drop(buffer);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            buffer_size: self.shared.buffer_size,
            in_flight: self.shared.in_flight.load(Ordering::Acquire),
            checkouts: self.shared.checkouts.load(Ordering::Relaxed),
            returns: self.shared.returns.load(Ordering::Relaxed),
            transient_allocations: self.shared.transient.load(Ordering::Relaxed),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    fn try_checkout(&self) -> Option<Buffer> {
        let permit = self.shared.available.try_acquire().ok()?;
        permit.forget();
        Some(self.checkout_slot())
    }

    /// Takes a free slot. The caller must already hold a semaphore permit for it.
    fn checkout_slot(&self) -> Buffer {
        let mut slots = self.lock_slots();
        let index = slots
            .free
            .pop()
            .expect("a semaphore permit guarantees a free slot");
        let data = match std::mem::replace(&mut slots.states[index], Slot::CheckedOut) {
            Slot::Free(data) => data,
            Slot::CheckedOut => unreachable!("slot {index} on the free list is checked out"),
        };
        drop(slots);

        self.record_checkout();
        Buffer {
            data: Some(data),
            len: 0,
            slot: Some(index),
            pool: self.clone(),
        }
    }

    fn transient(&self) -> Buffer {
        self.shared.transient.fetch_add(1, Ordering::Relaxed);
        self.record_checkout();
        Buffer {
            data: Some(vec![0u8; self.shared.buffer_size].into_boxed_slice()),
            len: 0,
            slot: None,
            pool: self.clone(),
        }
    }

    fn record_checkout(&self) {
        self.shared.checkouts.fetch_add(1, Ordering::Relaxed);
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self, slot: Option<usize>, data: Box<[u8]>) {
        let Some(index) = slot else {
            // Transient buffers are not pooled.
            self.record_return();
            return;
        };

        let mut slots = self.lock_slots();
        let checked_out = slots
            .states
            .get(index)
            .map(|state| matches!(state, Slot::CheckedOut));
        match checked_out {
            Some(true) => {
                slots.states[index] = Slot::Free(data);
                slots.free.push(index);
            }
            Some(false) => {
                drop(slots);
                log::error!("Buffer slot {index} returned to the pool twice");
                debug_assert!(false, "double return of pool slot {index}");
                return;
            }
            None => {
                drop(slots);
                log::error!("Buffer slot {index} does not exist in this pool");
                debug_assert!(false, "unknown pool slot {index}");
                return;
            }
        }
        drop(slots);

        self.record_return();
        self.shared.available.add_permits(1);
    }

    fn record_return(&self) {
        self.shared.returns.fetch_add(1, Ordering::Relaxed);
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        // The critical sections never panic while holding the lock.
        self.shared.slots.lock().expect("pool lock poisoned")
    }
}

/// A buffer checked out of a [`Pool`].
///
/// The buffer goes back to its pool when dropped.
#[derive(Debug)]
pub struct Buffer {
    data: Option<Box<[u8]>>,
    len: usize,
    slot: Option<usize>,
    pool: Pool,
}

impl Buffer {
    /// The whole writable area, for reading a datagram into.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or_default()
    }

    /// The bytes marked as filled by [`Buffer::set_len`].
    pub fn filled(&self) -> &[u8] {
        &self.data.as_deref().unwrap_or_default()[..self.len]
    }

    /// Marks the first `len` bytes as filled, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |data| data.len())
    }

    /// Returns true if the buffer was allocated outside of the pool's slots.
    pub fn is_transient(&self) -> bool {
        self.slot.is_none()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(self.slot, data);
        }
    }
}
