//! Foreign-intake queues: cross-thread staging for recycled handles.
//!
//! # Design
//!
//! A value recycled off its owner thread is not pushed onto the owner's
//! stack (that would need a lock on the hot path). Instead, each
//! (owner stack, foreign thread) pair gets one intake queue: an unbounded
//! chain of fixed-size *links*, each a power-of-two array of handle slots
//! with an atomic write index. Exactly one thread produces into a given
//! queue (the foreign thread, via its thread-local queue map) and exactly
//! one consumes (the stack owner, during scavenge) — the single-producer /
//! single-consumer discipline of a classic SPSC ring, unrolled into a
//! linked list so the queue never fills.
//!
//! # Ordering
//!
//! ```text
//! producer: write slot, then Release-store write_index
//! consumer: Acquire-load write_index, then read slots below it
//! ```
//!
//! The release/acquire pair on `write_index` publishes the slot contents
//! and the handle id stamped just before them. A fresh link is published
//! the same way: spliced with a Release store of `next` before any of its
//! slots are filled, so the consumer either misses it (and retries later)
//! or sees a fully valid link.
//!
//! # Capacity accounting
//!
//! Links are charged against the owning stack's shared-capacity counter in
//! whole-link units, reserved by CAS before a link may be allocated and
//! returned when the link is drained and freed. Each queue routes its
//! charges through a [`QueueCharge`] so the several reclaim paths — per-link
//! reclaim in transfer, dead-producer drain, queue drop, and the
//! unreachability cleaner — stay exactly-once per chunk.
//!
//! # Safety
//!
//! The owner-only and producer-only fields are `UnsafeCell`s; every access
//! is justified against the SPSC protocol at the use site. Link memory is
//! freed only by the consumer, and only for links that have a successor —
//! the producer never revisits a link once it has spliced a successor, so
//! the consumer cannot free memory the producer still touches.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use std::cell::UnsafeCell;
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;

use crate::cleaner;
use crate::tls::tag::{self, ThreadTag};

use super::handle::{next_unique_id, Handle};
use super::stack::{Deferred, Stack, StackLocal};

// ============================================================================
// Shared capacity
// ============================================================================

/// Per-stack bound on how much data foreign threads may stage toward it.
///
/// Lives in its own `Arc` so queues (and the cleaner's reclaim callbacks)
/// can outlive the stack without keeping it reachable.
pub(crate) struct SharedCapacity {
    available: CachePadded<AtomicUsize>,
    initial: usize,
}

impl SharedCapacity {
    pub(crate) fn new(initial: usize) -> Self {
        Self {
            available: CachePadded::new(AtomicUsize::new(initial)),
            initial,
        }
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn initial(&self) -> usize {
        self.initial
    }

    /// CAS-loop reservation of `chunk` slots; `false` when not enough
    /// capacity remains (the caller drops the value instead).
    fn try_reserve(&self, chunk: usize) -> bool {
        let mut available = self.available.load(Ordering::Relaxed);
        loop {
            if available < chunk {
                return false;
            }
            match self.available.compare_exchange_weak(
                available,
                available - chunk,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => available = seen,
            }
        }
    }

    fn reclaim(&self, chunk: usize) {
        let prev = self.available.fetch_add(chunk, Ordering::AcqRel);
        debug_assert!(prev + chunk <= self.initial, "shared capacity over-reclaimed");
    }
}

/// One queue's outstanding reservations against a [`SharedCapacity`].
///
/// Reclaim goes through checked decrements so that transfer, drop, and the
/// cleaner callback can race without double-returning a chunk.
pub(crate) struct QueueCharge {
    capacity: Arc<SharedCapacity>,
    reserved: AtomicUsize,
}

impl QueueCharge {
    fn new(capacity: Arc<SharedCapacity>) -> Self {
        Self {
            capacity,
            reserved: AtomicUsize::new(0),
        }
    }

    fn try_reserve(&self, chunk: usize) -> bool {
        if !self.capacity.try_reserve(chunk) {
            return false;
        }
        self.reserved.fetch_add(chunk, Ordering::AcqRel);
        true
    }

    /// Returns one chunk, unless a bulk reclaim already swept it.
    fn release_chunk(&self, chunk: usize) {
        let taken = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(chunk));
        if taken.is_ok() {
            self.capacity.reclaim(chunk);
        }
    }

    /// Returns every still-charged chunk. Idempotent.
    pub(crate) fn release_all(&self) {
        let n = self.reserved.swap(0, Ordering::AcqRel);
        if n > 0 {
            self.capacity.reclaim(n);
        }
    }

    #[cfg(test)]
    pub(crate) fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }
}

// ============================================================================
// Link
// ============================================================================

/// Fixed-size slot array within a queue.
struct Link<T> {
    /// Written by the producer below `write_index`, taken by the consumer.
    slots: Box<[UnsafeCell<Option<Handle<T>>>]>,
    /// Producer's publication index. Release-stored after the slot write.
    write_index: AtomicU32,
    /// Consumer's progress. Owner thread only.
    read_index: UnsafeCell<u32>,
    /// Successor link, spliced once by the producer (Release), read by the
    /// consumer (Acquire). Null until then.
    next: AtomicPtr<Link<T>>,
}

impl<T> Link<T> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| UnsafeCell::new(None)).collect(),
            write_index: AtomicU32::new(0),
            read_index: UnsafeCell::new(0),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

// ============================================================================
// ForeignQueue
// ============================================================================

/// Intake queue for one (owner stack, foreign thread) pair.
pub(crate) struct ForeignQueue<T> {
    /// Nonzero id stamped into `last_recycle_id` of every staged handle.
    id: u32,
    /// The producing thread; a dead weak means no more appends will come.
    producer: Weak<ThreadTag>,
    charge: Arc<QueueCharge>,
    link_capacity: usize,
    /// First link with unconsumed data. Owner thread only.
    head_link: UnsafeCell<*mut Link<T>>,
    /// Link currently accepting appends. Producer thread only.
    tail_link: UnsafeCell<*mut Link<T>>,
    /// Next queue targeting the same stack. Written by the installing
    /// thread before publication (under the stack's head lock), afterwards
    /// read and rewritten only by the owner during scavenge.
    next: UnsafeCell<Option<Arc<ForeignQueue<T>>>>,
}

// SAFETY: the SPSC protocol partitions all `UnsafeCell` fields between the
// single producer (`tail_link`, slot writes) and the single consumer
// (`head_link`, `read_index`, slot takes, `next`); the atomics carry the
// cross-thread publication. Handles move between threads, hence `T: Send`.
unsafe impl<T: Send> Send for ForeignQueue<T> {}
unsafe impl<T: Send> Sync for ForeignQueue<T> {}

impl<T: Send + 'static> ForeignQueue<T> {
    /// Creates a queue for the current (foreign) thread targeting `stack`,
    /// reserving its first link from the stack's shared capacity.
    ///
    /// Publishes the queue at the stack's head and registers the cleaner
    /// callback that returns outstanding charges if this thread dies.
    /// Returns `None` — and the caller drops the value — when capacity is
    /// exhausted or the current thread is already tearing down.
    pub(crate) fn allocate(stack: &Arc<Stack<T>>) -> Option<Arc<Self>> {
        let Some(producer) = tag::current() else {
            return None;
        };
        let charge = Arc::new(QueueCharge::new(stack.shared_capacity()));
        let link_capacity = stack.link_capacity();
        if !charge.try_reserve(link_capacity) {
            return None;
        }

        let first = Box::into_raw(Box::new(Link::new(link_capacity)));
        let queue = Arc::new(Self {
            id: next_unique_id(),
            producer: Arc::downgrade(&producer),
            charge: Arc::clone(&charge),
            link_capacity,
            head_link: UnsafeCell::new(first),
            tail_link: UnsafeCell::new(first),
            next: UnsafeCell::new(None),
        });
        stack.set_head(Arc::clone(&queue));

        // A producer that dies with charges outstanding would otherwise
        // starve the stack's shared capacity until the stack itself dies.
        cleaner::register(&producer, move || charge.release_all());

        Some(queue)
    }
}

impl<T> ForeignQueue<T> {
    pub(crate) fn producer_dead(&self) -> bool {
        self.producer.strong_count() == 0
    }

    #[cfg(test)]
    pub(crate) fn charge(&self) -> &QueueCharge {
        &self.charge
    }

    /// Links the queue list. Callers: the installing thread pre-publication
    /// (under the stack head lock) and the owner during scavenge unlink.
    ///
    /// # Safety
    /// Caller must be in one of the two positions above; they never run
    /// concurrently because publication is ordered by the head lock.
    pub(crate) unsafe fn set_next(&self, next: Option<Arc<ForeignQueue<T>>>) {
        debug_assert!(
            !next.as_ref().is_some_and(|n| std::ptr::eq(&**n, self)),
            "queue linked to itself"
        );
        *self.next.get() = next;
    }

    /// # Safety
    /// Owner thread only, on a published queue.
    pub(crate) unsafe fn next_queue(&self) -> Option<Arc<ForeignQueue<T>>> {
        (*self.next.get()).clone()
    }

    /// Stages `handle` for the owner, or silently drops it when the next
    /// link cannot be reserved.
    ///
    /// # Safety
    /// Producer thread only: this must be the thread whose queue map owns
    /// this queue.
    pub(crate) unsafe fn append(&self, handle: Handle<T>) {
        handle.last_recycle_id.store(self.id, Ordering::Relaxed);

        let tail_slot = self.tail_link.get();
        let mut tail = &**tail_slot;
        let mut write_index = tail.write_index.load(Ordering::Relaxed) as usize;
        if write_index == self.link_capacity {
            if !self.charge.try_reserve(self.link_capacity) {
                // Over shared capacity: the handle (and value) just die.
                return;
            }
            let fresh = Box::into_raw(Box::new(Link::new(self.link_capacity)));
            // Publish the empty link before moving the tail; the consumer
            // sees it with write_index 0 until the first slot lands.
            tail.next.store(fresh, Ordering::Release);
            *tail_slot = fresh;
            tail = &*fresh;
            write_index = 0;
        }

        *tail.slots[write_index].get() = Some(handle);
        // Publish the slot (and the id store above) to the consumer.
        tail.write_index.store(write_index as u32 + 1, Ordering::Release);
    }

    /// Moves one link's worth of staged handles into the owner stack.
    ///
    /// Returns `true` iff at least one handle landed in `local.elements`.
    /// Handles rejected by the drop policy are parked in `deferred` so
    /// their values drop outside the owner-state borrow.
    ///
    /// # Safety
    /// Owner thread only; `local` must be `stack`'s local state.
    ///
    /// # Panics
    /// Panics when a staged handle's id words disagree — the signature of
    /// a release that raced an acquire.
    pub(crate) unsafe fn transfer(
        &self,
        stack: &Stack<T>,
        local: &mut StackLocal<T>,
        deferred: &mut Deferred<T>,
    ) -> bool {
        let capacity = self.link_capacity;
        let head_slot = self.head_link.get();

        if *(**head_slot).read_index.get() as usize == capacity {
            let next = (**head_slot).next.load(Ordering::Acquire);
            if next.is_null() {
                return false;
            }
            // Fully drained link with a successor: free it and return its
            // chunk to the shared budget.
            drop(Box::from_raw(*head_slot));
            self.charge.release_chunk(capacity);
            *head_slot = next;
        }

        let link = &**head_slot;
        let src_start = *link.read_index.get() as usize;
        let mut src_end = link.write_index.load(Ordering::Acquire) as usize;
        if src_start == src_end {
            return false;
        }

        let dst_size = local.elements.len();
        if dst_size + (src_end - src_start) > local.cap {
            let actual = stack.increase_capacity(local, dst_size + (src_end - src_start));
            src_end = src_end.min(actual - dst_size + src_start);
            if src_start == src_end {
                // Destination stack is full.
                return false;
            }
        }

        let mut moved = false;
        for slot in &link.slots[src_start..src_end] {
            let element = (*slot.get()).take().expect("published slot was empty");
            let (recycle, last) = element.ids();
            if recycle == 0 {
                // Promote from queued-foreign to owned.
                element.recycle_id.store(last, Ordering::Relaxed);
            } else if recycle != last {
                panic!("handle recycled multiple times (inconsistent recycle state)");
            }
            if stack.drop_handle(local, &element) {
                deferred.handles.push(element);
                continue;
            }
            local.elements.push(element);
            moved = true;
        }
        *link.read_index.get() = src_end as u32;

        if src_end == capacity {
            let next = link.next.load(Ordering::Acquire);
            if !next.is_null() {
                drop(Box::from_raw(*head_slot));
                self.charge.release_chunk(capacity);
                *head_slot = next;
            }
        }
        moved
    }
}

impl<T> Drop for ForeignQueue<T> {
    fn drop(&mut self) {
        // Last reference: free the link chain (dropping any still-staged
        // handles) and return every outstanding chunk.
        let mut link = *self.head_link.get_mut();
        while !link.is_null() {
            // SAFETY: exclusive access; links are alive until freed here.
            let boxed = unsafe { Box::from_raw(link) };
            link = boxed.next.load(Ordering::Relaxed);
        }
        self.charge.release_all();
    }
}

// ============================================================================
// Loom Tests
// ============================================================================

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::pool::handle::{HandleCell, Pooled};
    use loom::thread;

    /// Exhaustively interleaves the link publication protocol: a slot write
    /// followed by a Release store of `write_index`, against Acquire loads
    /// and slot takes on the consumer side. The consumer must observe every
    /// published handle, in order, and never an empty published slot.
    #[test]
    fn link_publication_orders_slot_writes() {
        const COUNT: u32 = 2;

        loom::model(|| {
            let link = loom::sync::Arc::new(Link::<u32>::new(COUNT as usize));

            let producer = {
                let link = loom::sync::Arc::clone(&link);
                thread::spawn(move || {
                    for i in 0..COUNT {
                        let wi = link.write_index.load(Ordering::Relaxed) as usize;
                        let handle: Handle<u32> =
                            Arc::new(HandleCell::new(i, Weak::new()));
                        // SAFETY: single producer; slot at `wi` is
                        // unpublished until the store below.
                        unsafe { *link.slots[wi].get() = Some(handle) };
                        link.write_index.store(wi as u32 + 1, Ordering::Release);
                    }
                })
            };

            let consumer = {
                let link = loom::sync::Arc::clone(&link);
                thread::spawn(move || {
                    let mut read = 0usize;
                    let mut seen = Vec::new();
                    while seen.len() < COUNT as usize {
                        let published = link.write_index.load(Ordering::Acquire) as usize;
                        while read < published {
                            // SAFETY: slots below the Acquire-loaded index
                            // are published and owned by the consumer.
                            let handle = unsafe { (*link.slots[read].get()).take() }
                                .expect("published slot was empty");
                            seen.push(*(Pooled { cell: handle }));
                            read += 1;
                        }
                        if seen.len() < COUNT as usize {
                            thread::yield_now();
                        }
                    }
                    seen
                })
            };

            producer.join().unwrap();
            let seen = consumer.join().unwrap();
            assert_eq!(seen, vec![0, 1]);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_until_exhausted() {
        let capacity = SharedCapacity::new(48);
        assert!(capacity.try_reserve(16));
        assert!(capacity.try_reserve(16));
        assert!(capacity.try_reserve(16));
        assert!(!capacity.try_reserve(16));
        assert_eq!(capacity.available(), 0);
        capacity.reclaim(16);
        assert_eq!(capacity.available(), 16);
        assert!(capacity.try_reserve(16));
    }

    #[test]
    fn charge_release_chunk_is_exactly_once_against_release_all() {
        let capacity = Arc::new(SharedCapacity::new(64));
        let charge = QueueCharge::new(Arc::clone(&capacity));
        assert!(charge.try_reserve(16));
        assert!(charge.try_reserve(16));
        assert_eq!(charge.reserved(), 32);
        assert_eq!(capacity.available(), 32);

        charge.release_all();
        assert_eq!(capacity.available(), 64);

        // Late per-link release after the sweep must not over-return.
        charge.release_chunk(16);
        assert_eq!(capacity.available(), 64);
        charge.release_all();
        assert_eq!(capacity.available(), 64);
    }

    #[test]
    fn charge_mixed_release_paths_balance() {
        let capacity = Arc::new(SharedCapacity::new(64));
        let charge = QueueCharge::new(Arc::clone(&capacity));
        assert!(charge.try_reserve(16));
        assert!(charge.try_reserve(16));
        charge.release_chunk(16);
        assert_eq!(capacity.available(), 48);
        charge.release_all();
        assert_eq!(capacity.available(), 64);
        assert_eq!(charge.reserved(), 0);
    }

    #[test]
    fn concurrent_reservations_never_oversubscribe() {
        let capacity = Arc::new(SharedCapacity::new(1024));
        let granted = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let capacity = Arc::clone(&capacity);
                let granted = Arc::clone(&granted);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if capacity.try_reserve(16) {
                            granted.fetch_add(16, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(granted.load(Ordering::Relaxed), 1024);
        assert_eq!(capacity.available(), 0);
    }
}
