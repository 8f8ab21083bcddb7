//! Pooled values and their recycle handles.
//!
//! # Handle lifecycle
//!
//! Every pooled value lives inside a `HandleCell`, the durable pairing of
//! one user value with its recycle bookkeeping. The cell carries two id
//! words that encode where the handle is in its cycle:
//!
//! ```text
//! (recycle, last) = (0, 0)        fresh, or held by user code after acquire
//! (0, queue-id)                   staged in a foreign-intake queue
//! (owner, owner)                  resting in the owner stack
//! (queue-id, queue-id)            transferred out of a foreign queue
//! ```
//!
//! Acquisition zeroes both ids. Any release that observes nonzero ids is a
//! repeat release and fails; pop and transfer independently verify the two
//! ids agree, which catches unsynchronized racing releases after the fact.
//!
//! The ids are relaxed atomics: each transition is made by the thread that
//! logically holds the handle at that moment, and cross-thread visibility
//! rides the queue's acquire/release publication (or `join`).
//!
//! # Why the stack back-reference is weak
//!
//! A resting handle is owned by its stack's element array; a strong
//! back-reference would cycle (`Stack → HandleCell → Stack`) and pin every
//! stack forever. The weak reference also gives dead-owner semantics for
//! free: once the owner thread's stack is gone, recycling into it silently
//! drops the value. The no-op sink handed out when pooling is disabled is
//! simply a handle whose weak reference never upgrades.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use super::stack::Stack;

// ============================================================================
// Recycle ids
// ============================================================================

/// Mints nonzero ids for the owner sentinel and foreign queues. Zero is
/// reserved for the "free" id state.
static ID_GENERATOR: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_unique_id() -> u32 {
    ID_GENERATOR.fetch_add(1, Ordering::Relaxed)
}

/// The id stamped into both words by an owner-thread release.
pub(crate) fn owner_sentinel() -> u32 {
    static OWN: OnceLock<u32> = OnceLock::new();
    *OWN.get_or_init(next_unique_id)
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by [`Pooled::recycle`].
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum RecycleError {
    /// The handle is already back in the pool (or staged toward it); this
    /// release is a repeat. The pool state is unharmed.
    DoubleRecycle,
    /// The handle's id words disagree in a way a single well-ordered
    /// release history cannot produce; some release raced an acquire.
    InconsistentHandle,
}

impl fmt::Display for RecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoubleRecycle => write!(f, "value recycled multiple times"),
            Self::InconsistentHandle => {
                write!(f, "handle is in an inconsistent recycle state")
            }
        }
    }
}

impl std::error::Error for RecycleError {}

// ============================================================================
// HandleCell
// ============================================================================

/// Durable pairing of one user value with its recycle bookkeeping.
pub(crate) struct HandleCell<T> {
    value: T,
    pub(crate) recycle_id: AtomicU32,
    pub(crate) last_recycle_id: AtomicU32,
    /// Set once the drop policy has admitted this handle; later releases
    /// skip the admission counter entirely.
    pub(crate) drop_tested: AtomicBool,
    /// Originating stack. Weak by design; see module docs.
    pub(crate) stack: Weak<Stack<T>>,
}

impl<T> HandleCell<T> {
    pub(crate) fn new(value: T, stack: Weak<Stack<T>>) -> Self {
        Self {
            value,
            recycle_id: AtomicU32::new(0),
            last_recycle_id: AtomicU32::new(0),
            drop_tested: AtomicBool::new(false),
            stack,
        }
    }

    pub(crate) fn ids(&self) -> (u32, u32) {
        (
            self.recycle_id.load(Ordering::Relaxed),
            self.last_recycle_id.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn clear_ids(&self) {
        self.recycle_id.store(0, Ordering::Relaxed);
        self.last_recycle_id.store(0, Ordering::Relaxed);
    }
}

/// Shared ownership of a handle cell; how handles travel through stacks,
/// queues, and user hands.
pub(crate) type Handle<T> = Arc<HandleCell<T>>;

// ============================================================================
// Pooled
// ============================================================================

/// A value checked out of a [`super::Recycler`].
///
/// Dereferences to the user value. Cloning shares the same underlying
/// value (`Arc` semantics); exclusive mutation through [`Pooled::get_mut`]
/// requires the clone in hand to be the only reference.
///
/// Dropping a `Pooled` without calling [`Pooled::recycle`] simply frees
/// the value — nothing returns to the pool.
pub struct Pooled<T> {
    pub(crate) cell: Handle<T>,
}

impl<T> Pooled<T> {
    /// Wraps a value with a no-op sink handle (pooling disabled).
    pub(crate) fn unpooled(value: T) -> Self {
        Self {
            cell: Arc::new(HandleCell::new(value, Weak::new())),
        }
    }

    /// Returns this value to its pool.
    ///
    /// On the owning thread the value lands directly on that thread's
    /// stack; from any other thread it is staged in a per-thread intake
    /// queue for the owner to collect. Either way the pool may decide to
    /// drop the value instead (capacity, admission ratio, intake quota) —
    /// that is not an error.
    ///
    /// Fails with [`RecycleError::DoubleRecycle`] if the value is already
    /// in the pool and with [`RecycleError::InconsistentHandle`] if the
    /// handle shows signs of racing releases.
    pub fn recycle(&self) -> Result<(), RecycleError>
    where
        T: Send + 'static,
    {
        let (recycle, last) = self.cell.ids();
        if recycle != last {
            // A queued handle has (0, queue-id): this is a repeat release.
            // Nonzero-but-unequal words mean a racing release corrupted it.
            return if recycle == 0 {
                Err(RecycleError::DoubleRecycle)
            } else {
                Err(RecycleError::InconsistentHandle)
            };
        }
        let Some(stack) = self.cell.stack.upgrade() else {
            // No-op sink, or the owning thread (and its stack) is gone.
            return Ok(());
        };
        stack.push(Arc::clone(&self.cell))
    }

    /// Exclusive access to the value.
    ///
    /// Returns `None` unless `this` is the only reference to the value —
    /// the same uniqueness rule as [`Arc::get_mut`]. A stale clone kept
    /// across a recycle makes later holders read-only rather than racy.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        Arc::get_mut(&mut this.cell).map(|cell| &mut cell.value)
    }

    /// Whether two `Pooled`s refer to the same underlying value.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.cell, &b.cell)
    }
}

impl<T> Clone for Pooled<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.cell.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.cell.value).finish()
    }
}
