//! Per-thread indexed slot store.
//!
//! # Design
//!
//! A process-wide counter mints unique slot indices; each thread owns a
//! densely grown `Vec` addressed directly by index. Looking a slot up is a
//! thread-local access plus an array index — no hashing — which is what
//! makes per-thread pool stacks cheap to reach on the hot path.
//!
//! Unwritten slots hold a distinguished unset sentinel. It is
//! deliberately distinct from any user-level "empty" value: a caller may
//! store `Box<Option<T>>` containing `None` and the map still reports the
//! slot as set.
//!
//! # Growth
//!
//! Writing past the current length rounds `index + 1` up to the next power
//! of two (minimum 32) and fills the tail with `Unset`.
//!
//! # Teardown
//!
//! Dropping the thread's store (thread exit) runs each set slot's removal
//! hook, best-effort: a hook that panics is logged and skipped, and hooks
//! that reach back into thread-local state must tolerate failure, since
//! sibling thread-locals may already be gone.
//!
//! Slot indices are never reused; a dropped [`super::TlsSlot`] leaves its
//! per-thread values in place until each thread exits.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};

use ahash::AHashMap;

use crate::stdx::grow_pow2;

/// Minimum per-thread slot array length.
const MIN_CAPACITY: usize = 32;

/// Highest index the minting counter will hand out.
const MAX_INDEX: u32 = i32::MAX as u32;

static NEXT_INDEX: AtomicU32 = AtomicU32::new(0);

/// Errors from slot-index minting.
#[derive(Debug)]
#[non_exhaustive]
pub enum SlotError {
    /// The process-wide slot-index counter is exhausted. No slot was minted.
    Exhausted,
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "thread-local slot indices exhausted"),
        }
    }
}

impl std::error::Error for SlotError {}

/// One cell of a thread's slot array.
enum Slot {
    /// Never written (or removed). Distinct from any user value.
    Unset,
    Value(Box<dyn Any>),
}

impl Slot {
    fn is_set(&self) -> bool {
        matches!(self, Slot::Value(_))
    }
}

/// Hook run with a slot's value when the value is being discarded
/// wholesale (thread exit or [`remove_all`]). Individual removals go
/// through the typed owner instead.
pub(crate) type TeardownHook = Box<dyn Fn(Box<dyn Any>)>;

struct ThreadStore {
    slots: Vec<Slot>,
    /// Teardown hooks keyed by slot index, registered on first set.
    hooks: AHashMap<u32, TeardownHook>,
}

impl ThreadStore {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            hooks: AHashMap::new(),
        }
    }

    fn slot_mut(&mut self, index: u32) -> Option<&mut Slot> {
        self.slots.get_mut(index as usize)
    }

    /// Extracts every set value paired with its hook, leaving the store
    /// empty. Hook invocation happens at the caller, outside any borrow.
    fn drain(&mut self) -> Vec<(Box<dyn Any>, Option<TeardownHook>)> {
        let slots = mem::take(&mut self.slots);
        let mut hooks = mem::take(&mut self.hooks);
        slots
            .into_iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Unset => None,
                Slot::Value(v) => Some((v, hooks.remove(&(i as u32)))),
            })
            .collect()
    }
}

impl Drop for ThreadStore {
    fn drop(&mut self) {
        run_hooks(self.drain());
    }
}

fn run_hooks(drained: Vec<(Box<dyn Any>, Option<TeardownHook>)>) {
    for (value, hook) in drained {
        if let Some(hook) = hook {
            if catch_unwind(AssertUnwindSafe(|| hook(value))).is_err() {
                log::warn!("thread-local slot teardown hook panicked; skipped");
            }
        }
    }
}

thread_local! {
    static STORE: RefCell<ThreadStore> = RefCell::new(ThreadStore::new());
}

/// Mints the next slot index.
///
/// Indices are process-wide, ascending, and never reused. On exhaustion the
/// counter is rolled back and [`SlotError::Exhausted`] returned.
pub fn next_index() -> Result<u32, SlotError> {
    let index = NEXT_INDEX.fetch_add(1, Ordering::Relaxed);
    if index > MAX_INDEX {
        NEXT_INDEX.fetch_sub(1, Ordering::Relaxed);
        return Err(SlotError::Exhausted);
    }
    Ok(index)
}

/// Whether the current thread has a value in `index`.
pub fn is_set(index: u32) -> bool {
    STORE
        .try_with(|store| {
            store
                .borrow()
                .slots
                .get(index as usize)
                .is_some_and(Slot::is_set)
        })
        .unwrap_or(false)
}

/// Runs `f` with the current thread's value at `index`, or `None` if the
/// slot is unset (or the thread is tearing down).
pub fn with_value<R>(index: u32, f: impl FnOnce(Option<&mut Box<dyn Any>>) -> R) -> R {
    let mut f = Some(f);
    let result = STORE.try_with(|store| {
        let mut store = store.borrow_mut();
        match store.slot_mut(index) {
            Some(Slot::Value(v)) => Ok((f.take().expect("slot closure run twice"))(Some(v))),
            _ => Err(()),
        }
    });
    match result {
        Ok(Ok(r)) => r,
        // Unset slot, or TLS already destroyed.
        _ => (f.take().expect("slot closure run twice"))(None),
    }
}

/// Stores `value` at `index` for the current thread.
///
/// Returns `true` if the slot was previously unset. The teardown hook, if
/// any, is registered the first time the slot transitions to set. During
/// thread teardown the store is gone and the value is silently dropped.
pub(crate) fn set(index: u32, value: Box<dyn Any>, hook: Option<TeardownHook>) -> bool {
    let (was_unset, _previous) = STORE
        .try_with(|store| {
            let mut store = store.borrow_mut();
            let idx = index as usize;
            if idx >= store.slots.len() {
                let new_len = grow_pow2(idx, MIN_CAPACITY);
                store.slots.resize_with(new_len, || Slot::Unset);
            }
            let previous = mem::replace(&mut store.slots[idx], Slot::Value(value));
            let was_unset = !previous.is_set();
            if was_unset {
                if let Some(hook) = hook {
                    store.hooks.entry(index).or_insert(hook);
                }
            }
            (was_unset, previous)
        })
        .unwrap_or((false, Slot::Unset));
    // The replaced value drops here, outside the store borrow, where its
    // destructor may touch the slot map again.
    was_unset
}

/// Removes and returns the current thread's value at `index`.
///
/// The teardown hook is deregistered but *not* run; removal through the
/// typed [`super::TlsSlot`] owner fires its own callback.
pub fn remove(index: u32) -> Option<Box<dyn Any>> {
    STORE
        .try_with(|store| {
            let mut store = store.borrow_mut();
            store.hooks.remove(&index);
            match store.slot_mut(index) {
                Some(slot @ Slot::Value(_)) => match mem::replace(slot, Slot::Unset) {
                    Slot::Value(v) => Some(v),
                    Slot::Unset => unreachable!(),
                },
                _ => None,
            }
        })
        .ok()
        .flatten()
}

/// Clears every slot on the current thread, running teardown hooks.
///
/// Hooks run after the store borrow is released, so a hook may safely
/// reach back into the slot map (it will observe an empty store).
pub fn remove_all() {
    let drained = STORE
        .try_with(|store| store.borrow_mut().drain())
        .unwrap_or_default();
    run_hooks(drained);
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn indices_are_unique_and_ascending() {
        let a = next_index().unwrap();
        let b = next_index().unwrap();
        assert!(b > a);
    }

    #[test]
    fn unset_slot_reads_as_none() {
        let index = next_index().unwrap();
        assert!(!is_set(index));
        assert!(with_value(index, |v| v.is_none()));
        assert!(remove(index).is_none());
    }

    #[test]
    fn set_then_get_then_remove() {
        let index = next_index().unwrap();
        assert!(set(index, Box::new(41u64), None));
        assert!(is_set(index));
        with_value(index, |v| {
            let v = v.unwrap().downcast_mut::<u64>().unwrap();
            *v += 1;
        });
        let prev = remove(index).unwrap();
        assert_eq!(*prev.downcast::<u64>().unwrap(), 42);
        assert!(!is_set(index));
    }

    #[test]
    fn stored_none_is_still_set() {
        // A user-level "none" value is distinct from the unset sentinel.
        let index = next_index().unwrap();
        set(index, Box::new(Option::<u32>::None), None);
        assert!(is_set(index));
    }

    #[test]
    fn overwrite_reports_not_unset() {
        let index = next_index().unwrap();
        assert!(set(index, Box::new(1u32), None));
        assert!(!set(index, Box::new(2u32), None));
        let v = remove(index).unwrap();
        assert_eq!(*v.downcast::<u32>().unwrap(), 2);
    }

    #[test]
    fn slots_are_thread_isolated() {
        let index = next_index().unwrap();
        set(index, Box::new(7u32), None);
        std::thread::spawn(move || {
            assert!(!is_set(index));
        })
        .join()
        .unwrap();
        assert!(is_set(index));
    }

    #[test]
    fn teardown_runs_hooks_at_thread_exit() {
        let fired = Arc::new(AtomicUsize::new(0));
        let index = next_index().unwrap();
        let observed = Arc::clone(&fired);
        std::thread::spawn(move || {
            let fired = Arc::clone(&observed);
            set(
                index,
                Box::new(123u32),
                Some(Box::new(move |v| {
                    assert_eq!(*v.downcast::<u32>().unwrap(), 123);
                    fired.fetch_add(1, Ordering::Relaxed);
                })),
            );
        })
        .join()
        .unwrap();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn remove_all_runs_hooks_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let index = next_index().unwrap();
        let observed = Arc::clone(&fired);
        std::thread::spawn(move || {
            let fired = Arc::clone(&observed);
            set(
                index,
                Box::new(()),
                Some(Box::new(move |_| {
                    fired.fetch_add(1, Ordering::Relaxed);
                })),
            );
            remove_all();
            assert!(!is_set(index));
            // Thread exit must not fire the hook a second time.
        })
        .join()
        .unwrap();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn explicit_remove_skips_hook() {
        let fired = Arc::new(AtomicUsize::new(0));
        let index = next_index().unwrap();
        let observed = Arc::clone(&fired);
        std::thread::spawn(move || {
            let fired = Arc::clone(&observed);
            set(
                index,
                Box::new(()),
                Some(Box::new(move |_| {
                    fired.fetch_add(1, Ordering::Relaxed);
                })),
            );
            remove(index);
        })
        .join()
        .unwrap();
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }
}
