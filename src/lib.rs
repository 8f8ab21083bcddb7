//! Thread-biased object recycling with cross-thread handoff.
//!
//! The centerpiece is [`Recycler`], a per-type pool that keeps recycled
//! values on the thread that created them:
//! - acquire/recycle on the owning thread is a thread-local array pop/push;
//! - recycling from a foreign thread stages the value in a per-thread
//!   intake queue, collected lazily by the owner (*scavenging*);
//! - growth is admission-controlled: most first-time releases are dropped
//!   on purpose, and both per-thread stacks and cross-thread staging are
//!   bounded.
//!
//! Around the pool sit the subsystems it is built on, usable on their own:
//! - [`tls`]: indexed thread-local slots (array lookup instead of hashing);
//! - [`cleaner`]: run a callback once a referent becomes unreachable;
//! - [`promise`]: a one-shot settable result with FIFO listeners and
//!   blocking waiters.
//!
//! # Example
//!
//! ```
//! use repool::Recycler;
//!
//! let pool = Recycler::new(|| Vec::<u8>::with_capacity(1024)).unwrap();
//!
//! let mut buf = pool.acquire();
//! repool::Pooled::get_mut(&mut buf).unwrap().extend_from_slice(b"payload");
//! buf.recycle().unwrap();
//!
//! // The very next acquire on this thread reuses the same allocation.
//! let again = pool.acquire();
//! assert!(repool::Pooled::ptr_eq(&buf, &again));
//! ```

pub mod cleaner;
pub mod pool;
pub mod promise;
pub mod stdx;
pub mod tls;

#[cfg(test)]
pub mod test_utils;

pub use pool::{Pooled, Recycler, RecyclerConfig, RecycleError};
pub use promise::Promise;
pub use tls::{SlotError, TlsSlot};
