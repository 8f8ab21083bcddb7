//! Owner-thread stacks and the scavenge path.
//!
//! # Ownership discipline
//!
//! A [`Stack`] is created by, and biased toward, exactly one thread. Its
//! fields split three ways:
//!
//! - **owner-only** (`local`): the element array, capacity, admission
//!   counter, and the scavenge cursor. Touched without synchronization,
//!   justified by the thread check on every entry point.
//! - **lock-guarded** (`head`): the list of foreign-intake queues targeting
//!   this stack. Foreign threads prepend under the lock; the owner takes
//!   the same lock only to snapshot the head when (re)starting a scavenge
//!   pass — traversal itself is lock-free over `Arc` clones.
//! - **atomic** (`capacity`): the shared-capacity counter, CAS-reserved by
//!   foreign threads.
//!
//! # Push dispatch
//!
//! An owner-thread release goes straight onto the element array (after the
//! double-recycle and admission checks). A foreign release finds or
//! creates this thread's intake queue for the target stack in a
//! thread-local *queue map*; threads that exceed their per-thread queue
//! quota get a tombstone entry and their releases are dropped from then on.
//!
//! The queue map is weak-keyed in effect: entries hold a `Weak` to the
//! target stack and dead entries are purged when the map is about to hit
//! its quota, so a dead stack never permanently occupies a slot in a
//! foreign thread's quota.
//!
//! # Scavenge
//!
//! An empty pop walks the queue list from the remembered cursor, taking
//! the first queue that yields a transferred batch. Queues whose producer
//! thread died are drained to exhaustion and unlinked (the unlinked queue
//! is freed once the cursor moves off it, returning any remaining charged
//! links). A full pass without success resets the cursor to the list head
//! and reports failure so the caller can fall back to construction.

use std::any::Any;
use std::cell::UnsafeCell;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::ThreadId;

use ahash::AHashMap;

use crate::tls::{SlotError, TlsSlot};

use super::config::{Normalized, INITIAL_CAPACITY};
use super::handle::{owner_sentinel, Handle, HandleCell, RecycleError};
use super::queue::{ForeignQueue, SharedCapacity};

// ============================================================================
// Per-thread queue map
// ============================================================================

/// Map entry on a foreign thread: its intake queue for one target stack,
/// or a tombstone once that thread's queue quota is spent.
enum DelayedEntry {
    /// Quota tombstone: all further releases toward this stack are dropped.
    Dummy { stack: Weak<dyn Any + Send + Sync> },
    Queue {
        stack: Weak<dyn Any + Send + Sync>,
        queue: Arc<dyn Any + Send + Sync>,
    },
}

impl DelayedEntry {
    fn stack_alive(&self) -> bool {
        let (Self::Dummy { stack } | Self::Queue { stack, .. }) = self;
        stack.strong_count() != 0
    }
}

/// Keyed by the target stack's address (stable for the stack's lifetime;
/// the paired `Weak` guards against address reuse after death).
type DelayedMap = AHashMap<usize, DelayedEntry>;

fn delayed_slot() -> Option<&'static TlsSlot<DelayedMap>> {
    static SLOT: OnceLock<Option<TlsSlot<DelayedMap>>> = OnceLock::new();
    SLOT.get_or_init(|| {
        TlsSlot::new()
            .ok()
            .map(|slot| slot.initial_value(AHashMap::new))
    })
    .as_ref()
}

/// Mints the process-wide queue-map slot, surfacing exhaustion at pool
/// construction rather than at first foreign release.
pub(crate) fn ensure_delayed_slot() -> Result<(), SlotError> {
    delayed_slot().map(|_| ()).ok_or(SlotError::Exhausted)
}

/// Best-effort removal of a stack's entry from the current thread's queue
/// map (stack-slot teardown).
pub(crate) fn forget_stack(key: usize) {
    if let Some(slot) = delayed_slot() {
        let removed = slot.try_with(|map| map.remove(&key));
        // The entry (possibly the last reference to a queue full of staged
        // values) drops here, outside the thread-local borrow.
        drop(removed);
    }
}

// ============================================================================
// Stack
// ============================================================================

/// Resources released during a pop but whose destruction must wait until
/// the owner-state borrow ends: dropped values run user `Drop` impls that
/// may re-enter the pool.
pub(crate) struct Deferred<T> {
    /// Handles rejected by the drop policy during transfer.
    pub(crate) handles: Vec<Handle<T>>,
    /// Dead queues unlinked during scavenge; the last reference may still
    /// hold staged values the destination had no room for.
    pub(crate) queues: Vec<Arc<ForeignQueue<T>>>,
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self {
            handles: Vec::new(),
            queues: Vec::new(),
        }
    }
}

/// Owner-only mutable state.
pub(crate) struct StackLocal<T> {
    pub(crate) elements: Vec<Handle<T>>,
    /// Logical capacity; doubles on demand up to the configured maximum.
    pub(crate) cap: usize,
    /// Admission counter for the drop policy. Starts at the all-ones value
    /// so the very first fresh release is admitted.
    recycle_count: u32,
    cursor: Option<Arc<ForeignQueue<T>>>,
    prev: Option<Arc<ForeignQueue<T>>>,
}

/// Per-(pool, owner-thread) reservoir of recyclable handles.
pub(crate) struct Stack<T> {
    owner_thread: ThreadId,
    max_capacity: usize,
    max_delayed_queues: usize,
    link_capacity: usize,
    ratio_mask: u32,
    capacity: Arc<SharedCapacity>,
    /// Head of the foreign-intake queue list. See module docs.
    head: Mutex<Option<Arc<ForeignQueue<T>>>>,
    local: UnsafeCell<StackLocal<T>>,
}

// SAFETY: `local` is owner-thread-only (every entry point either runs on
// the owner by construction or checks the thread id); `head` is
// lock-guarded; `capacity` is atomic. Handles cross threads, so `T: Send`.
unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Stack<T> {
    pub(crate) fn new(config: &Normalized, owner_thread: ThreadId) -> Self {
        let cap = INITIAL_CAPACITY.min(config.max_capacity).max(1);
        Self {
            owner_thread,
            max_capacity: config.max_capacity,
            max_delayed_queues: config.max_delayed_queues,
            link_capacity: config.link_capacity,
            ratio_mask: config.ratio_mask,
            capacity: Arc::new(SharedCapacity::new(config.shared_capacity)),
            head: Mutex::new(None),
            local: UnsafeCell::new(StackLocal {
                elements: Vec::with_capacity(cap),
                cap,
                recycle_count: u32::MAX,
                cursor: None,
                prev: None,
            }),
        }
    }

    pub(crate) fn shared_capacity(&self) -> Arc<SharedCapacity> {
        Arc::clone(&self.capacity)
    }

    pub(crate) fn link_capacity(&self) -> usize {
        self.link_capacity
    }

    /// Prepends a freshly allocated intake queue to the queue list.
    pub(crate) fn set_head(&self, queue: Arc<ForeignQueue<T>>) {
        let mut head = self.head.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: `queue` is unpublished; the lock orders this write
        // against any concurrent installer and the owner's snapshot.
        unsafe { queue.set_next(head.take()) };
        *head = Some(queue);
    }

    fn head_snapshot(&self) -> Option<Arc<ForeignQueue<T>>> {
        self.head.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ------------------------------------------------------------------
    // Owner side
    // ------------------------------------------------------------------

    /// Takes the most recently pushed handle, scavenging the foreign
    /// queues if the stack is empty. Zeroes the handle's ids.
    ///
    /// Anything released along the way (policy-rejected handles, unlinked
    /// dead queues) is parked in `deferred`; the caller drops it after this
    /// returns.
    ///
    /// # Safety
    /// Owner thread only.
    ///
    /// # Panics
    /// Panics if the popped handle's id words disagree (racing releases).
    pub(crate) unsafe fn pop(&self, deferred: &mut Deferred<T>) -> Option<Handle<T>> {
        let local = &mut *self.local.get();
        if local.elements.is_empty() && !self.scavenge(local, deferred) {
            return None;
        }
        let handle = local.elements.pop()?;
        let (recycle, last) = handle.ids();
        if last != recycle {
            panic!("handle recycled multiple times (inconsistent recycle state)");
        }
        handle.clear_ids();
        Some(handle)
    }

    unsafe fn scavenge(&self, local: &mut StackLocal<T>, deferred: &mut Deferred<T>) -> bool {
        if self.scavenge_some(local, deferred) {
            return true;
        }
        // Wrapped without success: restart the next pass from the head so
        // queues installed since the last snapshot are seen.
        local.prev = None;
        local.cursor = self.head_snapshot();
        false
    }

    unsafe fn scavenge_some(
        &self,
        local: &mut StackLocal<T>,
        deferred: &mut Deferred<T>,
    ) -> bool {
        let (mut prev, mut cursor) = match &local.cursor {
            Some(cursor) => (local.prev.clone(), Arc::clone(cursor)),
            None => match self.head_snapshot() {
                Some(head) => (None, head),
                None => return false,
            },
        };

        let mut success = false;
        let final_cursor;
        loop {
            if cursor.transfer(self, local, deferred) {
                success = true;
                final_cursor = Some(cursor);
                break;
            }
            let next = cursor.next_queue();
            if cursor.producer_dead() {
                // The producer is gone; nothing more will ever be
                // published. Drain what it managed to stage, then unlink
                // so later passes skip the husk. Dropping the last Arc to
                // the queue returns its remaining charged links.
                loop {
                    if cursor.transfer(self, local, deferred) {
                        success = true;
                    } else {
                        break;
                    }
                }
                if let Some(prev) = &prev {
                    // Keep the unlinked queue alive past the owner borrow:
                    // its last reference may die with values still staged.
                    deferred.queues.push(Arc::clone(&cursor));
                    prev.set_next(next.clone());
                }
            } else {
                prev = Some(Arc::clone(&cursor));
            }
            match next {
                Some(next) => {
                    if success {
                        final_cursor = Some(next);
                        break;
                    }
                    cursor = next;
                }
                None => {
                    final_cursor = None;
                    break;
                }
            }
        }
        local.prev = prev;
        local.cursor = final_cursor;
        success
    }

    /// Grows the element array toward `expected`, doubling and clamping at
    /// the configured maximum. Returns the resulting capacity.
    pub(crate) fn increase_capacity(&self, local: &mut StackLocal<T>, expected: usize) -> usize {
        let mut new_cap = local.cap;
        loop {
            new_cap <<= 1;
            if new_cap >= expected || new_cap >= self.max_capacity {
                break;
            }
        }
        let new_cap = new_cap.min(self.max_capacity);
        if new_cap != local.cap {
            local.elements.reserve_exact(new_cap - local.elements.len());
            local.cap = new_cap;
        }
        new_cap
    }

    /// Admission filter, consulted once per release attempt.
    ///
    /// A handle that has never passed the filter advances the counter and
    /// is admitted only on every `ratio`-th fresh release; once admitted it
    /// is marked and bypasses the counter forever after.
    pub(crate) fn drop_handle(&self, local: &mut StackLocal<T>, handle: &HandleCell<T>) -> bool {
        if !handle.drop_tested.load(std::sync::atomic::Ordering::Relaxed) {
            local.recycle_count = local.recycle_count.wrapping_add(1);
            if local.recycle_count & self.ratio_mask != 0 {
                return true;
            }
            handle
                .drop_tested
                .store(true, std::sync::atomic::Ordering::Relaxed);
        }
        false
    }

    // ------------------------------------------------------------------
    // Release side
    // ------------------------------------------------------------------

    /// Returns `handle` to this stack, from whichever thread is calling.
    pub(crate) fn push(self: &Arc<Self>, handle: Handle<T>) -> Result<(), RecycleError>
    where
        T: Send + 'static,
    {
        if crate::tls::tag::current_thread_id() == self.owner_thread {
            // SAFETY: just verified we are the owner.
            unsafe { self.push_now(handle) }
        } else {
            self.push_later(handle);
            Ok(())
        }
    }

    /// # Safety
    /// Owner thread only.
    unsafe fn push_now(&self, handle: Handle<T>) -> Result<(), RecycleError> {
        let (recycle, last) = handle.ids();
        if (recycle | last) != 0 {
            return Err(RecycleError::DoubleRecycle);
        }
        let own = owner_sentinel();
        handle.recycle_id.store(own, std::sync::atomic::Ordering::Relaxed);
        handle
            .last_recycle_id
            .store(own, std::sync::atomic::Ordering::Relaxed);

        let local = &mut *self.local.get();
        if local.elements.len() >= self.max_capacity || self.drop_handle(local, &handle) {
            // Dropped, not an error: the value goes unpooled.
            return Ok(());
        }
        if local.elements.len() == local.cap {
            let new_cap = (local.cap * 2).min(self.max_capacity);
            local.elements.reserve_exact(new_cap - local.elements.len());
            local.cap = new_cap;
        }
        local.elements.push(handle);
        Ok(())
    }

    /// Stages `handle` in this (foreign) thread's intake queue for the
    /// stack, allocating the queue on first use. All overflow conditions
    /// (queue quota, shared capacity) drop the value silently.
    fn push_later(self: &Arc<Self>, handle: Handle<T>)
    where
        T: Send + 'static,
    {
        let Some(slot) = delayed_slot() else {
            return;
        };
        let key = Arc::as_ptr(self) as usize;
        // Entries evicted under quota pressure may hold the last reference
        // to a queue of staged values; they drop after the borrow ends.
        let mut evicted = Vec::new();
        let _ = slot.with(|map| {
            let queue = match map.get(&key) {
                Some(DelayedEntry::Dummy { .. }) => return,
                Some(DelayedEntry::Queue { queue, .. }) => Arc::clone(queue)
                    .downcast::<ForeignQueue<T>>()
                    .ok()
                    .expect("queue map entry has wrong pool type"),
                None => {
                    if map.len() >= self.max_delayed_queues {
                        // Quota pressure: evict entries whose stacks died
                        // before spending a tombstone on this one.
                        let dead: Vec<usize> = map
                            .iter()
                            .filter(|(_, entry)| !entry.stack_alive())
                            .map(|(k, _)| *k)
                            .collect();
                        evicted.extend(dead.into_iter().filter_map(|k| map.remove(&k)));
                    }
                    let stack_any: Arc<dyn Any + Send + Sync> = Arc::clone(self) as Arc<dyn Any + Send + Sync>;
                    let stack: Weak<dyn Any + Send + Sync> = Arc::downgrade(&stack_any);
                    if map.len() >= self.max_delayed_queues {
                        map.insert(key, DelayedEntry::Dummy { stack });
                        return;
                    }
                    let Some(queue) = ForeignQueue::allocate(self) else {
                        // Shared capacity exhausted; drop the value.
                        return;
                    };
                    map.insert(
                        key,
                        DelayedEntry::Queue {
                            stack,
                            queue: Arc::clone(&queue) as Arc<dyn Any + Send + Sync>,
                        },
                    );
                    queue
                }
            };
            // SAFETY: this thread's map owns the queue, making us its
            // single producer.
            unsafe { queue.append(handle) };
        });
    }

    // ------------------------------------------------------------------
    // Introspection (tests)
    // ------------------------------------------------------------------

    /// Sum of charged link chunks across this stack's queue list.
    ///
    /// # Safety
    /// Owner thread only (walks the queue links).
    #[cfg(test)]
    pub(crate) unsafe fn charged_in_queues(&self) -> usize {
        let mut total = 0;
        let mut cursor = self.head_snapshot();
        while let Some(queue) = cursor {
            total += queue.charge().reserved();
            cursor = queue.next_queue();
        }
        total
    }

    /// # Safety
    /// Owner thread only.
    #[cfg(test)]
    pub(crate) unsafe fn element_count(&self) -> usize {
        (*self.local.get()).elements.len()
    }
}
