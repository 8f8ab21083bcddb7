//! One-shot settable result with listeners and waiters.
//!
//! # State machine
//!
//! ```text
//! uncompleted ──► success(value)
//!      │    ╲──► failure(cause)
//!      │     ╲─► cancelled
//!      ▼
//! uncancellable ──► success / failure only
//! ```
//!
//! Terminal states are success, failure, and cancelled. `uncancellable` is a
//! non-terminal marker reachable only from uncompleted: it blocks `cancel`
//! but still admits success and failure, and `is_done` reports `false`
//! while it holds.
//!
//! # Completion mechanics
//!
//! Two delivery mechanisms share one state word:
//! - **waiters** block on a condvar ([`Promise::get`], [`Promise::wait_done`])
//!   and are woken by any terminal transition;
//! - **listeners** are callbacks fired exactly once, FIFO with respect to
//!   addition. A listener added after completion fires on the adding call;
//!   a listener added *by* a listener fires after the current notification
//!   wave; concurrent notification is serialized by a notifying flag so the
//!   FIFO order cannot interleave.
//!
//! Listeners run outside the state lock; a panicking listener is logged and
//! skipped, and the wave continues.
//!
//! # Bounds
//!
//! The waiter count is capped at `i16::MAX`; a wait beyond that fails with
//! [`WaitError::TooManyWaiters`] rather than silently degrading.

use std::fmt;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Failure cause attached to a failed promise.
///
/// Shared because every waiter and listener observes the same cause.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Upper bound on concurrently blocked waiters.
const MAX_WAITERS: u32 = i16::MAX as u32;

// ============================================================================
// Errors
// ============================================================================

/// Error from the completing side.
#[derive(Debug)]
#[non_exhaustive]
pub enum CompleteError {
    /// The promise already holds a terminal result.
    AlreadyComplete,
}

impl fmt::Display for CompleteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyComplete => write!(f, "promise is already complete"),
        }
    }
}

impl std::error::Error for CompleteError {}

/// Error from a bare wait.
#[derive(Debug)]
#[non_exhaustive]
pub enum WaitError {
    /// More than `i16::MAX` threads are already blocked on this promise.
    TooManyWaiters,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyWaiters => write!(f, "too many waiters on promise"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Error from a value-returning wait.
#[derive(Debug)]
#[non_exhaustive]
pub enum GetError {
    /// The promise was cancelled. Distinct from [`GetError::Failed`].
    Cancelled,
    /// The promise completed with a failure cause.
    Failed(Cause),
    /// The timeout elapsed before completion.
    Timeout,
    /// More than `i16::MAX` threads are already blocked on this promise.
    TooManyWaiters,
}

impl fmt::Display for GetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "promise was cancelled"),
            Self::Failed(cause) => write!(f, "promise failed: {cause}"),
            Self::Timeout => write!(f, "timed out waiting for promise"),
            Self::TooManyWaiters => write!(f, "too many waiters on promise"),
        }
    }
}

impl std::error::Error for GetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

/// Cause surfaced by [`Promise::cause`] for a cancelled promise.
#[derive(Debug)]
pub struct CancelledError;

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise was cancelled")
    }
}

impl std::error::Error for CancelledError {}

// ============================================================================
// State
// ============================================================================

enum Outcome<V> {
    Success(V),
    Failure(Cause),
    Cancelled,
}

type Listener<V> = Box<dyn FnOnce(&Promise<V>) + Send>;

/// Handle for removing a listener that has not yet fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct State<V> {
    outcome: Option<Outcome<V>>,
    /// Set only while `outcome` is `None`; blocks `cancel`.
    uncancellable: bool,
    /// Blocked threads; bounded by `MAX_WAITERS`.
    waiters: u32,
    /// Pending listeners. Empty means none were added or all were drained
    /// into a notification wave.
    listeners: Vec<(u64, Listener<V>)>,
    /// True while some thread is draining waves; enforces serialized, FIFO
    /// notification.
    notifying: bool,
    next_listener_id: u64,
}

struct Inner<V> {
    state: Mutex<State<V>>,
    done: Condvar,
}

// ============================================================================
// Promise
// ============================================================================

/// One-shot settable result.
///
/// Cheaply cloneable; all clones observe the same state. Any clone may
/// complete, wait, or listen.
pub struct Promise<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Promise<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for Promise<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Promise<V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: None,
                    uncancellable: false,
                    waiters: 0,
                    listeners: Vec::new(),
                    notifying: false,
                    next_listener_id: 0,
                }),
                done: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<V>> {
        // Listener panics happen outside the lock, so poisoning can only
        // come from a panicking completer; the state itself stays coherent.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Completing side
    // ------------------------------------------------------------------

    /// Marks the promise succeeded with `value`.
    ///
    /// Fails with [`CompleteError::AlreadyComplete`] if a terminal result is
    /// already set (`uncancellable` does not count as a result).
    pub fn set_success(&self, value: V) -> Result<(), CompleteError> {
        if self.complete(Outcome::Success(value)) {
            Ok(())
        } else {
            Err(CompleteError::AlreadyComplete)
        }
    }

    /// Like [`Promise::set_success`], but reports the race as `false`.
    pub fn try_success(&self, value: V) -> bool {
        self.complete(Outcome::Success(value))
    }

    /// Marks the promise failed with `cause`.
    pub fn set_failure(
        &self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Result<(), CompleteError> {
        if self.complete(Outcome::Failure(Arc::from(cause.into()))) {
            Ok(())
        } else {
            Err(CompleteError::AlreadyComplete)
        }
    }

    /// Like [`Promise::set_failure`], but reports the race as `false`.
    pub fn try_failure(
        &self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> bool {
        self.complete(Outcome::Failure(Arc::from(cause.into())))
    }

    /// Attempts to cancel. Returns `true` iff this call moved the promise
    /// to the cancelled state; `false` if it is uncancellable or already
    /// complete.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.lock();
            if state.outcome.is_some() || state.uncancellable {
                return false;
            }
            state.outcome = Some(Outcome::Cancelled);
            if state.waiters > 0 {
                self.inner.done.notify_all();
            }
        }
        self.notify_listeners();
        true
    }

    /// Bars future cancellation.
    ///
    /// Returns `true` if the promise is now uncancellable *or* already
    /// completed without being cancelled; `false` if it was cancelled.
    pub fn set_uncancellable(&self) -> bool {
        let mut state = self.lock();
        match &state.outcome {
            None => {
                state.uncancellable = true;
                true
            }
            Some(Outcome::Cancelled) => false,
            Some(_) => true,
        }
    }

    fn complete(&self, outcome: Outcome<V>) -> bool {
        {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            if state.waiters > 0 {
                self.inner.done.notify_all();
            }
        }
        self.notify_listeners();
        true
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Whether a terminal result is set. The `uncancellable` marker alone
    /// does not count as done.
    pub fn is_done(&self) -> bool {
        self.lock().outcome.is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.lock().outcome, Some(Outcome::Success(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.lock().outcome, Some(Outcome::Cancelled))
    }

    /// Whether `cancel` could still succeed.
    pub fn is_cancellable(&self) -> bool {
        let state = self.lock();
        state.outcome.is_none() && !state.uncancellable
    }

    /// Failure cause, if any. A cancelled promise reports a
    /// [`CancelledError`] cause; success and uncompleted report `None`.
    pub fn cause(&self) -> Option<Cause> {
        match &self.lock().outcome {
            Some(Outcome::Failure(cause)) => Some(Arc::clone(cause)),
            Some(Outcome::Cancelled) => Some(Arc::new(CancelledError)),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Waiting side
    // ------------------------------------------------------------------

    /// Blocks until the promise reaches a terminal state.
    pub fn wait_done(&self) -> Result<(), WaitError> {
        let mut state = self.lock();
        while state.outcome.is_none() {
            if state.waiters >= MAX_WAITERS {
                return Err(WaitError::TooManyWaiters);
            }
            state.waiters += 1;
            state = self
                .inner
                .done
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
            state.waiters -= 1;
        }
        Ok(())
    }

    /// Blocks up to `timeout`. Returns `Ok(true)` if terminal, `Ok(false)`
    /// on expiry.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.outcome.is_some() {
                return Ok(true);
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
            else {
                return Ok(false);
            };
            if state.waiters >= MAX_WAITERS {
                return Err(WaitError::TooManyWaiters);
            }
            state.waiters += 1;
            let (guard, _timed_out) = self
                .inner
                .done
                .wait_timeout(state, remaining)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            state.waiters -= 1;
        }
    }

    /// Blocks until terminal and returns the value.
    pub fn get(&self) -> Result<V, GetError>
    where
        V: Clone,
    {
        self.wait_done().map_err(|e| match e {
            WaitError::TooManyWaiters => GetError::TooManyWaiters,
        })?;
        self.terminal_value()
    }

    /// Blocks up to `timeout` and returns the value.
    pub fn get_timeout(&self, timeout: Duration) -> Result<V, GetError>
    where
        V: Clone,
    {
        let done = self.wait_timeout(timeout).map_err(|e| match e {
            WaitError::TooManyWaiters => GetError::TooManyWaiters,
        })?;
        if !done {
            return Err(GetError::Timeout);
        }
        self.terminal_value()
    }

    /// The success value if the promise already succeeded; `None` for
    /// uncompleted, failed, cancelled, or uncancellable promises.
    pub fn get_now(&self) -> Option<V>
    where
        V: Clone,
    {
        match &self.lock().outcome {
            Some(Outcome::Success(v)) => Some(v.clone()),
            _ => None,
        }
    }

    fn terminal_value(&self) -> Result<V, GetError>
    where
        V: Clone,
    {
        match &self.lock().outcome {
            Some(Outcome::Success(v)) => Ok(v.clone()),
            Some(Outcome::Failure(cause)) => Err(GetError::Failed(Arc::clone(cause))),
            Some(Outcome::Cancelled) => Err(GetError::Cancelled),
            None => unreachable!("terminal_value called before completion"),
        }
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Adds a completion listener.
    ///
    /// If the promise is already terminal the listener fires on this call
    /// (or is folded into a notification wave already in progress).
    pub fn add_listener(
        &self,
        listener: impl FnOnce(&Promise<V>) + Send + 'static,
    ) -> ListenerId {
        let (id, already_done) = {
            let mut state = self.lock();
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            state.listeners.push((id, Box::new(listener)));
            (id, state.outcome.is_some())
        };
        if already_done {
            self.notify_listeners();
        }
        ListenerId(id)
    }

    /// Removes a listener that has not fired yet. Removing an unknown or
    /// already-fired listener is a silent no-op (`false`).
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        match state.listeners.iter().position(|(lid, _)| *lid == id.0) {
            Some(at) => {
                state.listeners.remove(at);
                true
            }
            None => false,
        }
    }

    /// Drains listener waves until none remain.
    ///
    /// The notifying flag serializes waves across threads: whoever sets it
    /// owns draining, and late additions land in `listeners` for the owner
    /// to pick up — preserving FIFO order within and across waves.
    fn notify_listeners(&self) {
        let mut batch = {
            let mut state = self.lock();
            if state.notifying || state.listeners.is_empty() {
                return;
            }
            state.notifying = true;
            mem::take(&mut state.listeners)
        };

        loop {
            for (_, listener) in batch {
                if catch_unwind(AssertUnwindSafe(|| listener(self))).is_err() {
                    log::warn!("promise listener panicked; skipped");
                }
            }
            let mut state = self.lock();
            if state.listeners.is_empty() {
                state.notifying = false;
                return;
            }
            batch = mem::take(&mut state.listeners);
        }
    }
}

impl<V> fmt::Debug for Promise<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        let s = match &state.outcome {
            None if state.uncancellable => "uncancellable",
            None => "uncompleted",
            Some(Outcome::Success(_)) => "success",
            Some(Outcome::Failure(_)) => "failure",
            Some(Outcome::Cancelled) => "cancelled",
        };
        f.debug_struct("Promise").field("state", &s).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
