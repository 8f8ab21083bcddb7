//! Pool configuration.
//!
//! Knobs are process-wide per pool and fixed at construction. Raw values
//! are normalized the way the pool expects them (power-of-two link sizes
//! and ratios, clamped share factor) rather than rejected; a pool never
//! fails to construct because of a capacity knob.

use crate::stdx::next_pow2;

/// Default per-thread stack bound.
const DEFAULT_MAX_CAPACITY: usize = 4 * 1024;

/// Initial stack array length (clamped to the max capacity).
pub(crate) const INITIAL_CAPACITY: usize = 256;

/// Tuning for a [`super::Recycler`].
///
/// The defaults match long-observed pooling behavior: a 4 Ki handle bound
/// per thread, half of it claimable by foreign threads, and a 1-in-8
/// admission ratio that keeps bursty release storms from inflating the
/// pool.
#[derive(Clone, Copy, Debug)]
pub struct RecyclerConfig {
    /// Upper bound on each owner stack. Zero disables pooling entirely:
    /// every acquired value gets a no-op handle and recycling is a silent
    /// drop.
    pub max_capacity_per_thread: usize,

    /// Divisor for the shared (foreign-claimable) capacity:
    /// `available = max(max_capacity / factor, link_capacity)`.
    pub shared_capacity_factor: usize,

    /// Per foreign thread, how many distinct owner stacks it may forward
    /// to. Further stacks get a tombstone entry and their releases are
    /// dropped.
    pub max_delayed_queues_per_thread: usize,

    /// Handles per foreign-queue link. Rounded up to a power of two.
    pub link_capacity: usize,

    /// One of every `ratio` first-time releases is admitted; the rest are
    /// dropped. Rounded up to a power of two.
    pub ratio: u32,
}

impl Default for RecyclerConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(2, |n| n.get());
        Self {
            max_capacity_per_thread: DEFAULT_MAX_CAPACITY,
            shared_capacity_factor: 2,
            max_delayed_queues_per_thread: 2 * cpus,
            link_capacity: 16,
            ratio: 8,
        }
    }
}

impl RecyclerConfig {
    pub(crate) fn normalized(&self) -> Normalized {
        let link_capacity = next_pow2(self.link_capacity.min(u32::MAX as usize) as u32) as usize;
        let ratio_mask = next_pow2(self.ratio) - 1;
        let factor = self.shared_capacity_factor.max(2);
        let shared_capacity = (self.max_capacity_per_thread / factor).max(link_capacity);
        Normalized {
            max_capacity: self.max_capacity_per_thread,
            max_delayed_queues: self.max_delayed_queues_per_thread,
            link_capacity,
            ratio_mask,
            shared_capacity,
        }
    }
}

/// Normalized knobs, as the stack consumes them.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Normalized {
    pub(crate) max_capacity: usize,
    pub(crate) max_delayed_queues: usize,
    pub(crate) link_capacity: usize,
    pub(crate) ratio_mask: u32,
    /// Initial value of the shared-capacity counter.
    pub(crate) shared_capacity: usize,
}
