//! Per-thread liveness token.
//!
//! Each thread lazily owns one `Arc<ThreadTag>`, dropped by thread-local
//! teardown when the thread exits. Holding a `Weak<ThreadTag>` is the
//! crate's stand-in for a weak thread reference: `upgrade()` (or a nonzero
//! strong count) answers "is that thread still alive?" without keeping the
//! thread's state reachable.
//!
//! The pool stores a weak tag per foreign-intake queue so the owning stack
//! can detect a dead producer during scavenge, and the cleaner uses the tag
//! as the unreachability referent for capacity reclamation.

use std::sync::{Arc, Weak};
use std::thread::ThreadId;

/// Identity token for one thread.
///
/// The token's reachability, not its contents, is the signal: it exists
/// exactly as long as its thread does.
#[derive(Debug)]
pub(crate) struct ThreadTag {
    id: ThreadId,
}

thread_local! {
    static TAG: Arc<ThreadTag> = Arc::new(ThreadTag {
        id: std::thread::current().id(),
    });
}

/// The current thread's id, read from the cached tag where possible.
///
/// Equivalent to `std::thread::current().id()` without cloning the thread
/// handle on every call; the pool's release path asks on every recycle.
pub(crate) fn current_thread_id() -> ThreadId {
    TAG.try_with(|tag| tag.id)
        .unwrap_or_else(|_| std::thread::current().id())
}

/// Strong handle to the current thread's tag.
///
/// Returns `None` during thread teardown, once the thread-local slot has
/// been destroyed; callers treat that as "thread already gone".
pub(crate) fn current() -> Option<Arc<ThreadTag>> {
    TAG.try_with(Arc::clone).ok()
}

/// Weak handle to the current thread's tag.
///
/// During teardown this degrades to a never-upgradable `Weak`, which reads
/// as an already-dead thread — the correct answer for that window.
pub(crate) fn current_weak() -> Weak<ThreadTag> {
    TAG.try_with(Arc::downgrade).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_stable_within_a_thread() {
        let a = current().unwrap();
        let b = current().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(current_thread_id(), std::thread::current().id());
    }

    #[test]
    fn weak_tag_dies_with_thread() {
        let weak = std::thread::spawn(current_weak).join().unwrap();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn weak_tag_upgrades_while_thread_lives() {
        let weak = current_weak();
        assert!(weak.upgrade().is_some());
    }
}
