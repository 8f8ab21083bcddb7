//! Indexed thread-local storage.
//!
//! # Design
//!
//! Conventional thread-local maps hash a key on every access. Here, each
//! logical thread-local mints a process-unique *slot index* once, at
//! construction, and every thread stores its value for that slot in a dense
//! array — lookup is an index, not a hash probe. The pool leans on this:
//! reaching the current thread's stack is `tls array[pool's slot]`.
//!
//! # Module map
//! - `slot_map`: the per-thread array, index minting, unset sentinel,
//!   growth, and teardown hooks.
//! - `slot`: [`TlsSlot`], the typed owner of one index with initial-value
//!   and on-removed hooks.
//! - `tag`: per-thread liveness token (`Weak`-observable thread identity).

pub mod slot;
pub mod slot_map;
pub(crate) mod tag;

pub use slot::TlsSlot;
pub use slot_map::SlotError;
