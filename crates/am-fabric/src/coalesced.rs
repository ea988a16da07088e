//! Coalescing send path.
//!
//! One [`Coalesced`] batches user sends sharing a destination into bounded
//! per-destination buffers and ships each buffer as a single transport
//! message when it fills, when a flush seals it early, or when the
//! coalescing heuristic asks for one.
//!
//! Per destination the state is one `MessageBuffer`: a backing region drawn
//! from the type's cache plus one packed atomic word. The low bits of
//! `count_allocated` count reserved slots; the [`SENDER_ACTIVE`] bit marks a
//! seal in progress. Packing both into one word makes the seal atomic with
//! the final slot reservation:
//!
//! ```text
//! empty ──first reserve──▶ filling ──last slot / flush CAS──▶ sealed
//!   ▲                                                           │
//!   └────── fresh region installed, counters cleared ◀──────────┘
//! ```
//!
//! A sender that observes the seal bit (or a full count) backs off with a
//! pause hint and retries; it never blocks. The sealer waits for every
//! sibling writer to commit (`count_written == count`), swaps in a fresh
//! region, and only then hands the old region to the transport, so the
//! receive side always observes fully-written slots `[0, n)`.

use crate::buffer_cache::{BufferCache, RegionLease};
use crate::fabric::Fabric;
use crate::heuristic::{FlushHeuristic, NoFlush};
use crate::message_type::MessageType;
use crate::scheduler::Priority;
use crate::sorter::{BufferSorter, NoSort};
use crate::transport::SharedRankSet;
use crate::Rank;
use am::pause::pause;
#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

/// Seal flag packed into the top bit of `count_allocated`.
const SENDER_ACTIVE: u32 = 1 << 31;
/// Mask extracting the reserved-slot count.
const COUNT_MASK: u32 = SENDER_ACTIVE - 1;

/// Construction parameters of a coalesced message type.
pub struct CoalescedConfig<H = NoFlush> {
    /// Number of elements batched per destination before auto-send.
    pub capacity: usize,
    /// Dispatch priority of received messages.
    pub priority: Priority,
    /// Heuristic consulted after every send.
    pub heuristic: H,
}

impl CoalescedConfig<NoFlush> {
    /// Config with the given capacity, normal priority, and no heuristic.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            priority: Priority::Normal,
            heuristic: NoFlush,
        }
    }
}

impl<H> CoalescedConfig<H> {
    /// Replaces the dispatch priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Replaces the heuristic.
    pub fn heuristic<H2>(self, heuristic: H2) -> CoalescedConfig<H2> {
        CoalescedConfig {
            capacity: self.capacity,
            priority: self.priority,
            heuristic,
        }
    }
}

/// Per-destination bounded send buffer. Padded out to its own cache lines;
/// every sender thread hammers the atomics of its hot destinations.
#[repr(align(128))]
struct MessageBuffer<T> {
    count_allocated: AtomicU32,
    count_written: AtomicU32,
    registered_with_td: AtomicBool,
    data: AtomicPtr<T>,
    lease: Mutex<Option<Arc<RegionLease>>>,
}

impl<T> MessageBuffer<T> {
    fn new() -> Self {
        Self {
            count_allocated: AtomicU32::new(0),
            count_written: AtomicU32::new(0),
            registered_with_td: AtomicBool::new(false),
            data: AtomicPtr::new(std::ptr::null_mut()),
            lease: Mutex::new(None),
        }
    }

    /// Installs a fresh region and clears every counter. The cleared
    /// `count_allocated` is published last: a sender released by it must
    /// already observe the new region.
    fn reset(&self, fresh: Arc<RegionLease>) -> Option<Arc<RegionLease>> {
        let previous = {
            let mut lease = self.lease.lock();
            let previous = lease.take();
            self.data.store(fresh.base_ptr() as *mut T, Ordering::Release);
            *lease = Some(fresh);
            previous
        };
        self.registered_with_td.store(false, Ordering::Release);
        self.count_written.store(0, Ordering::Release);
        self.count_allocated.store(0, Ordering::Release);
        previous
    }
}

struct CoalescedInner<T, S, H> {
    message_type: MessageType<T>,
    cache: BufferCache,
    capacity: usize,
    buffers: Vec<MessageBuffer<T>>,
    last_active: Vec<AtomicU32>,
    handler: Mutex<Option<Arc<dyn Fn(Rank, &T) + Send + Sync>>>,
    sorter: S,
    heuristic: H,
    possible_dests: SharedRankSet,
    alive: Arc<AtomicBool>,
}

impl<T, S, H> Drop for CoalescedInner<T, S, H> {
    fn drop(&mut self) {
        // Flush callbacks and the receive shim check this before touching us.
        self.alive.store(false, Ordering::Release);
    }
}

/// Coalesced message type: the user-facing send surface.
pub struct Coalesced<T, S = NoSort, H = NoFlush> {
    inner: Arc<CoalescedInner<T, S, H>>,
}

impl<T, S, H> Clone for Coalesced<T, S, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, S, H> Coalesced<T, S, H>
where
    T: Copy + Send + 'static,
    S: BufferSorter<T> + 'static,
    H: FlushHeuristic + 'static,
{
    /// Registers a coalesced type on `fabric` that may send to and receive
    /// from every rank.
    pub fn new(config: CoalescedConfig<H>, fabric: &Fabric, sorter: S) -> Self {
        Self::with_rank_sets(config, fabric, sorter, None, None)
    }

    /// As [`new`](Self::new), restricting destination and source ranks.
    pub fn with_rank_sets(
        config: CoalescedConfig<H>,
        fabric: &Fabric,
        sorter: S,
        possible_dests: Option<SharedRankSet>,
        possible_sources: Option<SharedRankSet>,
    ) -> Self {
        assert!(config.capacity >= 1, "coalescing capacity must be positive");
        let message_type = fabric.create_message_type::<T>(config.priority);
        message_type.set_max_count(config.capacity);
        if let Some(sources) = possible_sources {
            message_type.set_possible_sources(sources);
        }
        if let Some(dests) = possible_dests {
            message_type.set_possible_dests(dests);
        }
        let possible_dests = message_type.possible_dests();

        let cache = BufferCache::new(
            config.capacity * std::mem::size_of::<T>(),
            std::mem::align_of::<T>().max(64),
        );

        let size = fabric.size();
        let buffers: Vec<MessageBuffer<T>> = (0..size).map(|_| MessageBuffer::new()).collect();
        let last_active: Vec<AtomicU32> = (0..size).map(|_| AtomicU32::new(0)).collect();

        let inner = Arc::new(CoalescedInner {
            message_type,
            cache,
            capacity: config.capacity,
            buffers,
            last_active,
            handler: Mutex::new(None),
            sorter,
            heuristic: config.heuristic,
            possible_dests,
            alive: Arc::new(AtomicBool::new(true)),
        });

        for idx in 0..inner.possible_dests.len() {
            let dest = inner.possible_dests.rank_at(idx);
            debug_assert!(dest < size);
            let fresh = inner
                .cache
                .allocate()
                .unwrap_or_else(|e| inner.message_type.fabric().fatal(e));
            let previous = inner.buffers[dest].reset(fresh);
            debug_assert!(previous.is_none());
        }

        Self::install_receive_shim(&inner);
        Self::install_flush_object(&inner);

        Self { inner }
    }

    fn install_receive_shim(inner: &Arc<CoalescedInner<T, S, H>>) {
        let weak = Arc::downgrade(inner);
        let message_type = inner.message_type.clone();
        message_type.set_raw_handler(move |src, payload: Arc<RegionLease>, count| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.alive.load(Ordering::Acquire) {
                return;
            }
            let fabric = inner.message_type.fabric();
            fabric
                .counters()
                .message_received(src, count, std::mem::size_of::<T>());

            // SAFETY: the lease travelled here with the message and nothing
            // else holds it; `count` committed elements of `T` sit at the
            // front of a region allocated with `T`'s alignment.
            let elements = unsafe {
                std::slice::from_raw_parts_mut(payload.base_ptr() as *mut T, count)
            };
            inner.sorter.sort(elements);

            let handler = inner.handler.lock().clone();
            let Some(handler) = handler else {
                debug_assert!(false, "bulk message arrived before set_handler");
                return;
            };
            for element in elements.iter() {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(src, element)));
                if let Err(panic_payload) = outcome {
                    fabric.inner().record_handler_failure(panic_payload);
                }
            }
        });
    }

    fn install_flush_object(inner: &Arc<CoalescedInner<T, S, H>>) {
        let weak = Arc::downgrade(inner);
        let alive = Arc::clone(&inner.alive);
        inner.message_type.fabric().add_flush_object(move || {
            if !alive.load(Ordering::Acquire) {
                return false;
            }
            match weak.upgrade() {
                Some(inner) => {
                    Self::flush_inner(&inner);
                    true
                }
                None => false,
            }
        });
    }

    /// Installs the per-element handler. Must happen before the first
    /// message of this type arrives.
    pub fn set_handler(&self, handler: impl Fn(Rank, &T) + Send + Sync + 'static) {
        *self.inner.handler.lock() = Some(Arc::new(handler));
    }

    /// The underlying typed registration.
    pub fn message_type(&self) -> &MessageType<T> {
        &self.inner.message_type
    }

    /// Coalescing capacity per destination.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Enqueues `arg` for `dest`, sealing and shipping the destination's
    /// buffer when this send fills it. Never blocks; contended or sealing
    /// buffers are spun on with a pause hint.
    pub fn send(&self, arg: T, dest: Rank) {
        let inner = &self.inner;
        let fabric = inner.message_type.fabric();
        debug_assert!(fabric.is_valid_rank(dest), "send to rank {dest}");
        debug_assert!(
            inner.possible_dests.contains(dest),
            "rank {dest} is outside this type's destination set"
        );
        debug_assert!(fabric.in_epoch(), "send outside an epoch");
        let capacity = inner.capacity as u32;
        let buf = &inner.buffers[dest];

        loop {
            loop {
                let state = buf.count_allocated.load(Ordering::Acquire);
                if state & SENDER_ACTIVE == 0 && (state & COUNT_MASK) < capacity {
                    break;
                }
                pause();
            }

            let my_id = buf.count_allocated.fetch_add(1, Ordering::AcqRel);
            if my_id & SENDER_ACTIVE != 0 {
                continue;
            }
            let slot = my_id & COUNT_MASK;
            if slot >= capacity {
                continue;
            }

            let data = buf.data.load(Ordering::Acquire);
            // SAFETY: `slot` was reserved exclusively by the fetch_add and
            // the region cannot be swapped before this write is committed
            // via `count_written`.
            unsafe {
                data.add(slot as usize).write(arg);
            }

            if slot == capacity - 1 {
                // Last slot: seal in place of the count, then ship.
                buf.count_allocated.store(SENDER_ACTIVE, Ordering::Release);
                if !buf.registered_with_td.swap(true, Ordering::AcqRel) {
                    inner.message_type.message_being_built(dest);
                }
                buf.count_written.fetch_add(1, Ordering::Release);
                fabric.counters().full_buffer_send(
                    dest,
                    capacity as usize,
                    std::mem::size_of::<T>(),
                );
                Self::ship(inner, buf, capacity, dest);
            } else {
                if slot == 0 && !buf.registered_with_td.swap(true, Ordering::AcqRel) {
                    inner.message_type.message_being_built(dest);
                }
                buf.count_written.fetch_add(1, Ordering::Release);
            }

            if inner.heuristic.execute() {
                Self::flush_inner(inner);
            }
            return;
        }
    }

    /// Tells the termination detector a message for `dest` is being built,
    /// independent of any element landing first.
    pub fn message_being_built(&self, dest: Rank) {
        let inner = &self.inner;
        debug_assert!(inner.message_type.fabric().is_valid_rank(dest));
        if !inner.buffers[dest]
            .registered_with_td
            .swap(true, Ordering::AcqRel)
        {
            inner.message_type.message_being_built(dest);
        }
    }

    /// Seals and ships every destination's partially-filled buffer.
    ///
    /// A destination that made progress since the previous flush pass is
    /// skipped this time; a destination racing a regular sender to the final
    /// slot is left to that sender.
    pub fn flush(&self) {
        Self::flush_inner(&self.inner);
    }

    fn flush_inner(inner: &CoalescedInner<T, S, H>) {
        let capacity = inner.capacity as u32;
        for idx in 0..inner.possible_dests.len() {
            let dest = inner.possible_dests.rank_at(idx);
            let buf = &inner.buffers[dest];
            let observed = buf.count_allocated.load(Ordering::Acquire);
            if observed != inner.last_active[dest].load(Ordering::Relaxed) {
                inner.last_active[dest].store(observed, Ordering::Relaxed);
                continue;
            }

            let mut current = observed;
            let sealed = loop {
                if current == 0 || current >= capacity {
                    // Empty, already sealing, or a regular sender will seal.
                    break None;
                }
                match buf.count_allocated.compare_exchange_weak(
                    current,
                    SENDER_ACTIVE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break Some(current),
                    Err(next) => {
                        current = next;
                        pause();
                    }
                }
            };

            if let Some(count) = sealed {
                inner.message_type.fabric().counters().flushed_message_size(
                    dest,
                    count as usize,
                    std::mem::size_of::<T>(),
                );
                Self::ship(inner, buf, count, dest);
            }
        }
    }

    /// Ships the sealed buffer holding `count` committed elements. Waits for
    /// sibling writers, swaps in a fresh region, then submits the old one.
    fn ship(inner: &CoalescedInner<T, S, H>, buf: &MessageBuffer<T>, my_id: u32, dest: Rank) -> bool {
        debug_assert!(buf.count_allocated.load(Ordering::Relaxed) & SENDER_ACTIVE != 0);
        if my_id & SENDER_ACTIVE != 0 {
            return false;
        }
        let count = my_id & COUNT_MASK;
        debug_assert!(count as usize <= inner.capacity);
        if count == 0 {
            return false;
        }

        while buf.count_written.load(Ordering::Acquire) != count {
            pause();
        }
        debug_assert!(buf.registered_with_td.load(Ordering::Relaxed));

        let fabric = inner.message_type.fabric();
        let fresh = inner
            .cache
            .allocate()
            .unwrap_or_else(|e| fabric.fatal(e));
        let outbound = buf
            .reset(fresh)
            .expect("sealed buffer owns its backing region");
        if let Err(e) = inner.message_type.send(outbound, count as usize, dest) {
            fabric.fatal(e);
        }
        true
    }
}

#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::{COUNT_MASK, SENDER_ACTIVE};
    use loom::sync::atomic::{AtomicU32, Ordering};
    use loom::sync::Arc;
    use loom::thread;

    /// Model of the packed-counter seal protocol: reserve via fetch_add,
    /// commit via count_written, seal on the last slot.
    struct LoomBuffer {
        capacity: u32,
        count_allocated: AtomicU32,
        count_written: AtomicU32,
        slots: Vec<AtomicU32>,
        sealed_sum: AtomicU32,
    }

    impl LoomBuffer {
        fn new(capacity: u32) -> Self {
            Self {
                capacity,
                count_allocated: AtomicU32::new(0),
                count_written: AtomicU32::new(0),
                slots: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
                sealed_sum: AtomicU32::new(0),
            }
        }

        fn send(&self, value: u32) {
            loop {
                let state = self.count_allocated.load(Ordering::Acquire);
                if state & SENDER_ACTIVE != 0 || (state & COUNT_MASK) >= self.capacity {
                    thread::yield_now();
                    continue;
                }
                let my_id = self.count_allocated.fetch_add(1, Ordering::AcqRel);
                if my_id & SENDER_ACTIVE != 0 || (my_id & COUNT_MASK) >= self.capacity {
                    continue;
                }
                let slot = (my_id & COUNT_MASK) as usize;
                self.slots[slot].store(value, Ordering::Relaxed);
                if my_id & COUNT_MASK == self.capacity - 1 {
                    self.count_allocated.store(SENDER_ACTIVE, Ordering::Release);
                    self.count_written.fetch_add(1, Ordering::Release);
                    while self.count_written.load(Ordering::Acquire) != self.capacity {
                        thread::yield_now();
                    }
                    let mut sum = 0;
                    for slot in &self.slots {
                        let v = slot.load(Ordering::Relaxed);
                        assert_ne!(v, 0, "sealed buffer exposed an unwritten slot");
                        sum += v;
                    }
                    self.sealed_sum.store(sum, Ordering::Release);
                } else {
                    self.count_written.fetch_add(1, Ordering::Release);
                }
                return;
            }
        }
    }

    #[test]
    #[ignore]
    fn slow_loom_seal_waits_for_every_writer() {
        loom::model(|| {
            const CAPACITY: u32 = 2;
            let buf = Arc::new(LoomBuffer::new(CAPACITY));

            let a = {
                let buf = Arc::clone(&buf);
                thread::spawn(move || buf.send(10))
            };
            let b = {
                let buf = Arc::clone(&buf);
                thread::spawn(move || buf.send(20))
            };
            a.join().unwrap();
            b.join().unwrap();

            assert_eq!(
                buf.sealed_sum.load(Ordering::Acquire),
                30,
                "exactly one seal must observe both committed slots"
            );
        });
    }
}
