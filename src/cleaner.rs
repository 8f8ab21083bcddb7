//! Unreachability-triggered cleanup.
//!
//! # Contract
//!
//! [`register`] remembers a referent through a `Weak` reference and runs the
//! supplied callback exactly once after the referent has become unreachable
//! (every strong reference dropped). Invocation is best-effort in timing:
//! never before unreachability, no bound on how long after.
//!
//! # Design
//!
//! Rust has no reference queues, so unreachability is detected by a
//! sweeping poll: live registrations sit in a [`ConcurrentSet`] and a single
//! background thread checks each probe's strong count on an interval. The
//! sweeper thread is spawned lazily on first registration, exits when the
//! registration set drains, and is respawned by the next registration — a
//! CAS on a running flag keeps it unique, with a post-clear re-check so a
//! registration racing the shutdown is not stranded.
//!
//! The pool registers one callback per foreign-intake queue, with the
//! producing thread's tag as referent, so link reservations charged by a
//! thread that died still flow back to the owning stack's shared capacity.
//!
//! A panicking callback is logged and treated as consumed.

use std::any::Any;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use crate::stdx::ConcurrentSet;

/// Delay between sweep passes while registrations are outstanding.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

const CLEANER_THREAD_NAME: &str = "repool-cleaner";

type CleanupFn = Box<dyn FnOnce() + Send>;

struct Registration {
    id: u64,
    /// Liveness probe only; never upgraded.
    probe: Weak<dyn Any + Send + Sync>,
    /// Taken exactly once, by the sweeper.
    task: Mutex<Option<CleanupFn>>,
}

/// Set entry with identity keyed by registration id.
#[derive(Clone)]
struct Reg(Arc<Registration>);

impl PartialEq for Reg {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Reg {}

impl Hash for Reg {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

struct Registry {
    live: ConcurrentSet<Reg>,
    running: AtomicBool,
    next_id: AtomicU64,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        live: ConcurrentSet::new(),
        running: AtomicBool::new(false),
        next_id: AtomicU64::new(1),
    })
}

/// Registers `cleanup` to run exactly once after `referent` becomes
/// unreachable.
///
/// The registration itself holds only a `Weak`, so it does not extend the
/// referent's lifetime.
pub fn register<R: Send + Sync + 'static>(
    referent: &Arc<R>,
    cleanup: impl FnOnce() + Send + 'static,
) {
    let reg = registry();
    let referent: Arc<dyn Any + Send + Sync> = Arc::clone(referent) as Arc<dyn Any + Send + Sync>;
    let probe: Weak<dyn Any + Send + Sync> = Arc::downgrade(&referent);
    let id = reg.next_id.fetch_add(1, Ordering::Relaxed);
    reg.live.insert(Reg(Arc::new(Registration {
        id,
        probe,
        task: Mutex::new(Some(Box::new(cleanup))),
    })));

    if reg
        .running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        let spawned = std::thread::Builder::new()
            .name(CLEANER_THREAD_NAME.to_owned())
            .spawn(|| cleaner_loop(registry()));
        if spawned.is_err() {
            // Leave the flag set rather than thrash respawn attempts; the
            // next sweep_now() or successful spawn picks the work up.
            log::warn!("failed to spawn {CLEANER_THREAD_NAME} thread");
        }
    }
}

fn cleaner_loop(reg: &'static Registry) {
    loop {
        while !reg.live.is_empty() {
            sweep(reg);
            std::thread::sleep(SWEEP_INTERVAL);
        }
        reg.running.store(false, Ordering::Release);
        // A registration may have arrived between the last sweep and the
        // flag clear; reclaim the running role instead of stranding it.
        if reg.live.is_empty()
            || reg
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            break;
        }
    }
}

fn sweep(reg: &Registry) {
    for entry in reg.live.keys() {
        if entry.0.probe.strong_count() != 0 {
            continue;
        }
        let task = entry.0.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                log::warn!("unreachability cleanup callback panicked; skipped");
            }
        }
        reg.live.remove(&entry);
    }
}

/// Immediate sweep pass, for deterministic tests.
#[cfg(test)]
pub(crate) fn sweep_now() {
    if let Some(reg) = REGISTRY.get() {
        sweep(reg);
    }
}
