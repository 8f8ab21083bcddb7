//! Typed owner of one thread-local slot.
//!
//! [`TlsSlot<V>`] mints its slot index eagerly at construction and then
//! gives every thread an independent `V` at that index. The slot object
//! itself is `Send + Sync` and is typically stored in a shared structure
//! (the pool keeps one per `Recycler`); the per-thread values never cross
//! threads.
//!
//! Two optional hooks mirror the slot map's lifecycle:
//! - an initial-value hook, run on first per-thread access;
//! - an on-removed hook, run with the outgoing value on [`TlsSlot::remove`]
//!   and, best-effort, when a thread exits with the slot still set.

use std::marker::PhantomData;
use std::sync::Arc;

use super::slot_map::{self, SlotError, TeardownHook};

type InitFn<V> = dyn Fn() -> V + Send + Sync;
type RemovedFn<V> = dyn Fn(&V) + Send + Sync;

/// A typed thread-local slot with a process-unique index.
pub struct TlsSlot<V: 'static> {
    index: u32,
    init: Option<Arc<InitFn<V>>>,
    removed: Option<Arc<RemovedFn<V>>>,
    _marker: PhantomData<fn() -> V>,
}

impl<V: 'static> TlsSlot<V> {
    /// Mints a new slot index.
    ///
    /// Fails with [`SlotError::Exhausted`] if the process-wide index space
    /// is spent; no index is consumed in that case.
    pub fn new() -> Result<Self, SlotError> {
        Ok(Self {
            index: slot_map::next_index()?,
            init: None,
            removed: None,
            _marker: PhantomData,
        })
    }

    /// Sets the per-thread initial value hook.
    pub fn initial_value(mut self, f: impl Fn() -> V + Send + Sync + 'static) -> Self {
        self.init = Some(Arc::new(f));
        self
    }

    /// Sets the hook run with a value as it leaves the slot.
    pub fn on_removed(mut self, f: impl Fn(&V) + Send + Sync + 'static) -> Self {
        self.removed = Some(Arc::new(f));
        self
    }

    /// This slot's process-unique index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Whether the current thread has a value in this slot.
    pub fn is_set(&self) -> bool {
        slot_map::is_set(self.index)
    }

    /// Stores `value` for the current thread, replacing any previous value.
    pub fn set(&self, value: V) {
        slot_map::set(self.index, Box::new(value), self.teardown_hook());
    }

    /// Runs `f` with the current thread's value, initializing it first if
    /// the slot is unset and an initial-value hook exists.
    ///
    /// Returns `None` when the slot is unset and has no initializer, or
    /// when the calling thread is already tearing down its locals.
    pub fn with<R>(&self, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut f = Some(f);
        let hit = slot_map::with_value(self.index, |v| {
            v.and_then(|boxed| boxed.downcast_mut::<V>())
                .map(|v| (f.take().expect("slot closure run twice"))(v))
        });
        if let Some(r) = hit {
            return Some(r);
        }
        let init = self.init.as_ref()?;
        if !slot_map::set(self.index, Box::new(init()), self.teardown_hook()) && !self.is_set() {
            // Thread-local storage is gone; the freshly made value was dropped.
            return None;
        }
        slot_map::with_value(self.index, |v| {
            v.and_then(|boxed| boxed.downcast_mut::<V>())
                .map(|v| (f.take().expect("slot closure run twice"))(v))
        })
    }

    /// Runs `f` with the current thread's value without initializing.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut f = Some(f);
        slot_map::with_value(self.index, |v| {
            v.and_then(|boxed| boxed.downcast_mut::<V>())
                .map(|v| (f.take().expect("slot closure run twice"))(v))
        })
    }

    /// Clone of the current thread's value, initializing if possible.
    pub fn get(&self) -> Option<V>
    where
        V: Clone,
    {
        self.with(|value| value.clone())
    }

    /// Removes and returns the current thread's value, firing `on_removed`.
    pub fn remove(&self) -> Option<V> {
        let boxed = slot_map::remove(self.index)?;
        let value = boxed
            .downcast::<V>()
            .expect("slot value type mismatch (index reuse)");
        if let Some(cb) = &self.removed {
            cb(&value);
        }
        Some(*value)
    }

    fn teardown_hook(&self) -> Option<TeardownHook> {
        let cb = self.removed.clone()?;
        Some(Box::new(move |boxed| {
            if let Ok(v) = boxed.downcast::<V>() {
                cb(&v);
            }
        }))
    }
}

impl<V: 'static> std::fmt::Debug for TlsSlot<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSlot").field("index", &self.index).finish()
    }
}
