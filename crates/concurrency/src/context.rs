//! Lockable context
//!
//! A bounded pool of transaction scopes. Entering the context claims one of
//! `capacity` transaction slots from a [`SlotArray`]; at most `capacity`
//! threads can therefore hold write access to the context's needles at once.
//!
//! # Scope lifecycle
//!
//! ```text
//! enter() ──claim slot──> Scope (depth 1) ──enter() again──> depth 2 ...
//!    │ full                                                    │
//!    └── park on `freed` until a slot is released        drop outermost guard
//!                                                              │
//!                         release captured needles <───────────┘
//!                         release slot, wake one waiter
//! ```
//!
//! Scopes are thread-affine. The current thread's active scopes live in a
//! thread-local registry keyed by context identity, which is how
//! [`LockableNeedle`](crate::LockableNeedle) finds "the current scope" without
//! any global state. Nested `enter` calls on a thread that is already inside
//! the context reuse the active scope instead of claiming a second slot.

use crate::backoff::Backoff;
use crate::needle::NeedleLock;
use crate::slot_array::{SlotArray, SlotRef};
use needlework_core::{ContextConfig, Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identity of one scope: the transaction slot it occupies
///
/// The slot version makes ids unique over the context's lifetime even though
/// slot indices are recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(SlotRef);

impl ScopeId {
    /// Transaction slot index
    pub fn slot(&self) -> usize {
        self.0.index
    }

    /// Occupancy version of the slot
    pub fn version(&self) -> u64 {
        self.0.version
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}.{}", self.0.index, self.0.version)
    }
}

/// Payload of an occupied transaction slot
#[derive(Debug, Clone)]
struct ScopeRecord {
    thread: ThreadId,
}

pub(crate) struct ContextInner {
    slots: SlotArray<ScopeRecord>,
    gate: Mutex<()>,
    freed: Condvar,
    config: ContextConfig,
}

impl ContextInner {
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// Per-thread state of an active scope
pub(crate) struct ScopeState {
    id: ScopeId,
    context: Arc<ContextInner>,
    depth: Cell<usize>,
    captures: RefCell<SmallVec<[Arc<NeedleLock>; 8]>>,
}

impl ScopeState {
    pub(crate) fn id(&self) -> ScopeId {
        self.id
    }

    pub(crate) fn record_capture(&self, lock: Arc<NeedleLock>) {
        self.captures.borrow_mut().push(lock);
    }

    pub(crate) fn forget_capture(&self, lock: &Arc<NeedleLock>) {
        self.captures
            .borrow_mut()
            .retain(|held| !Arc::ptr_eq(held, lock));
    }

    fn belongs_to(&self, context: &Arc<ContextInner>) -> bool {
        Arc::ptr_eq(&self.context, context)
    }

    /// Outermost guard dropped: release captures, then the slot
    fn exit(&self) {
        let captured = std::mem::take(&mut *self.captures.borrow_mut());
        let released = captured.len();
        for lock in captured {
            lock.release(self.id);
        }

        let key = self.context.key();
        // The registry may already be gone if the thread is shutting down
        let _ = ACTIVE_SCOPES.try_with(|scopes| {
            scopes.borrow_mut().retain(|active| active.context != key);
        });

        if let Err(e) = self.context.slots.release(self.id.slot()) {
            warn!(
                target: "needlework::context",
                scope = %self.id,
                error = %e,
                "Transaction slot already free"
            );
        }
        {
            let _gate = self.context.gate.lock();
            self.context.freed.notify_one();
        }
        debug!(target: "needlework::context", scope = %self.id, released, "Scope exited");
    }
}

struct ActiveScope {
    context: usize,
    state: Rc<ScopeState>,
}

thread_local! {
    static ACTIVE_SCOPES: RefCell<SmallVec<[ActiveScope; 2]>> = RefCell::new(SmallVec::new());
}

/// Bounded pool of transaction scopes
///
/// Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct LockableContext {
    inner: Arc<ContextInner>,
}

impl LockableContext {
    /// Context allowing `capacity` concurrently active scopes
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(ContextConfig::new().with_capacity(capacity))
    }

    /// Context from a full configuration
    pub fn with_config(config: ContextConfig) -> Result<Self> {
        config.validate()?;
        Ok(LockableContext {
            inner: Arc::new(ContextInner {
                slots: SlotArray::new(config.capacity)?,
                gate: Mutex::new(()),
                freed: Condvar::new(),
                config,
            }),
        })
    }

    /// Maximum number of concurrently active scopes
    pub fn capacity(&self) -> usize {
        self.inner.slots.capacity()
    }

    /// Number of scopes currently active across all threads (best-effort)
    pub fn active_scopes(&self) -> usize {
        self.inner.slots.count()
    }

    /// Threads currently holding a scope, in slot order (best-effort)
    pub fn active_threads(&self) -> Vec<ThreadId> {
        self.inner
            .slots
            .iter()
            .map(|(_, record)| record.thread)
            .collect()
    }

    pub(crate) fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    /// Enter the context, waiting for a free slot
    ///
    /// Waits forever unless the context was configured with an enter timeout.
    /// Reuses the current thread's scope if it is already inside.
    pub fn enter(&self) -> Result<Scope> {
        self.enter_until(self.inner.config.enter_timeout())
    }

    /// Enter the context, giving up after `timeout`
    pub fn enter_timeout(&self, timeout: Duration) -> Result<Scope> {
        self.enter_until(Some(timeout))
    }

    /// Enter the context only if a slot is free right now
    pub fn try_enter(&self) -> Option<Scope> {
        if let Some(scope) = self.reenter() {
            return Some(scope);
        }
        let record = self.record();
        self.inner
            .slots
            .try_claim(record)
            .ok()
            .map(|slot| self.register(slot))
    }

    /// True if the current thread is inside this context
    pub fn in_scope(&self) -> bool {
        self.current_state().is_some()
    }

    /// Id of the current thread's scope in this context
    pub fn current_scope(&self) -> Option<ScopeId> {
        self.current_state().map(|state| state.id())
    }

    pub(crate) fn current_state(&self) -> Option<Rc<ScopeState>> {
        let key = self.inner.key();
        ACTIVE_SCOPES
            .try_with(|scopes| {
                scopes
                    .borrow()
                    .iter()
                    .find(|active| active.context == key)
                    .map(|active| Rc::clone(&active.state))
            })
            .ok()
            .flatten()
    }

    pub(crate) fn owns(&self, scope: &Scope) -> bool {
        scope.state.belongs_to(&self.inner)
    }

    fn record(&self) -> ScopeRecord {
        ScopeRecord {
            thread: thread::current().id(),
        }
    }

    fn reenter(&self) -> Option<Scope> {
        self.current_state().map(|state| {
            state.depth.set(state.depth.get() + 1);
            Scope { state }
        })
    }

    fn enter_until(&self, timeout: Option<Duration>) -> Result<Scope> {
        if let Some(scope) = self.reenter() {
            return Ok(scope);
        }
        let slot = match self.inner.slots.try_claim(self.record()) {
            Ok(slot) => slot,
            Err(record) => self.wait_for_slot(record, timeout)?,
        };
        Ok(self.register(slot))
    }

    /// Park until a slot frees up
    ///
    /// Each claim attempt happens under `gate`, and releasers notify under
    /// `gate` after freeing their slot, so a release can't slip in between a
    /// failed attempt and the wait. A failed attempt while the count still
    /// shows a free slot means another thread was mid-operation on it; that
    /// is retried with backoff instead of parking, since its release has
    /// already notified.
    fn wait_for_slot(
        &self,
        mut record: ScopeRecord,
        timeout: Option<Duration>,
    ) -> Result<SlotRef> {
        let started = Instant::now();
        let deadline = timeout.map(|timeout| started + timeout);
        debug!(
            target: "needlework::context",
            capacity = self.capacity(),
            "Context full, waiting for a slot"
        );

        let mut backoff = Backoff::new();
        let mut gate = self.inner.gate.lock();
        loop {
            match self.inner.slots.try_claim(record) {
                Ok(slot) => return Ok(slot),
                Err(back) => record = back,
            }
            let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if !expired && self.inner.slots.count() < self.capacity() {
                MutexGuard::unlocked(&mut gate, || backoff.snooze());
                continue;
            }
            backoff = Backoff::new();
            match deadline {
                Some(deadline) => {
                    if self.inner.freed.wait_until(&mut gate, deadline).timed_out() {
                        return self.inner.slots.try_claim(record).map_err(|_| {
                            warn!(
                                target: "needlework::context",
                                waited = ?started.elapsed(),
                                "Timed out entering context"
                            );
                            Error::Timeout {
                                operation: "enter lockable context",
                                waited: started.elapsed(),
                            }
                        });
                    }
                }
                None => self.inner.freed.wait(&mut gate),
            }
        }
    }

    fn register(&self, slot: SlotRef) -> Scope {
        let state = Rc::new(ScopeState {
            id: ScopeId(slot),
            context: Arc::clone(&self.inner),
            depth: Cell::new(1),
            captures: RefCell::new(SmallVec::new()),
        });
        ACTIVE_SCOPES.with(|scopes| {
            scopes.borrow_mut().push(ActiveScope {
                context: self.inner.key(),
                state: Rc::clone(&state),
            });
        });
        debug!(target: "needlework::context", scope = %state.id, "Scope entered");
        Scope { state }
    }
}

impl fmt::Debug for LockableContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockableContext")
            .field("capacity", &self.capacity())
            .field("active_scopes", &self.active_scopes())
            .finish()
    }
}

/// Active transaction window of the current thread
///
/// Dropping the outermost guard (including during unwinding) releases every
/// needle captured in the scope and frees the transaction slot. Not `Send`:
/// a scope belongs to the thread that entered it.
pub struct Scope {
    state: Rc<ScopeState>,
}

impl Scope {
    /// Identity of this scope
    pub fn id(&self) -> ScopeId {
        self.state.id
    }

    /// Nesting depth: 1 for the outermost guard
    pub fn depth(&self) -> usize {
        self.state.depth.get()
    }

    /// Number of needles currently captured by this scope
    pub fn captured(&self) -> usize {
        self.state.captures.borrow().len()
    }

    pub(crate) fn state(&self) -> &Rc<ScopeState> {
        &self.state
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let depth = self.state.depth.get().saturating_sub(1);
        self.state.depth.set(depth);
        if depth == 0 {
            self.state.exit();
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.state.id)
            .field("depth", &self.depth())
            .field("captured", &self.captured())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(LockableContext::new(0).unwrap_err().is_argument_error());
    }

    #[test]
    fn test_enter_and_exit() {
        let context = LockableContext::new(2).unwrap();
        assert!(!context.in_scope());
        {
            let scope = context.enter().unwrap();
            assert!(context.in_scope());
            assert_eq!(context.current_scope(), Some(scope.id()));
            assert_eq!(context.active_scopes(), 1);
            assert_eq!(context.active_threads(), vec![thread::current().id()]);
        }
        assert!(!context.in_scope());
        assert_eq!(context.active_scopes(), 0);
    }

    #[test]
    fn test_nested_enter_reuses_scope() {
        let context = LockableContext::new(1).unwrap();
        let outer = context.enter().unwrap();
        let inner = context.enter().unwrap();
        assert_eq!(outer.id(), inner.id());
        assert_eq!(inner.depth(), 2);
        assert_eq!(context.active_scopes(), 1);

        drop(inner);
        assert!(context.in_scope());
        assert_eq!(outer.depth(), 1);

        drop(outer);
        assert!(!context.in_scope());
        assert_eq!(context.active_scopes(), 0);
    }

    #[test]
    fn test_nested_guards_dropped_out_of_order() {
        let context = LockableContext::new(1).unwrap();
        let outer = context.enter().unwrap();
        let inner = context.enter().unwrap();
        drop(outer);
        assert!(context.in_scope());
        drop(inner);
        assert!(!context.in_scope());
    }

    #[test]
    fn test_scopes_are_per_context() {
        let a = LockableContext::new(1).unwrap();
        let b = LockableContext::new(1).unwrap();
        let _in_a = a.enter().unwrap();
        assert!(a.in_scope());
        assert!(!b.in_scope());
        let _in_b = b.enter().unwrap();
        assert!(b.in_scope());
    }

    #[test]
    fn test_try_enter_at_capacity() {
        let context = LockableContext::new(1).unwrap();
        let _held = context.enter().unwrap();

        let other = context.clone();
        let entered = thread::spawn(move || other.try_enter().is_some())
            .join()
            .unwrap();
        assert!(!entered);

        // Same thread re-enters even at capacity
        assert!(context.try_enter().is_some());
    }

    #[test]
    fn test_enter_timeout_at_capacity() {
        let context = LockableContext::new(1).unwrap();
        let _held = context.enter().unwrap();

        let other = context.clone();
        let err = thread::spawn(move || {
            other
                .enter_timeout(Duration::from_millis(20))
                .map(|_| ())
                .unwrap_err()
        })
        .join()
        .unwrap();
        assert!(err.is_timeout());
        assert_eq!(context.active_scopes(), 1);
    }

    #[test]
    fn test_configured_enter_timeout() {
        let config = ContextConfig::new()
            .with_capacity(1)
            .with_enter_timeout(Duration::from_millis(10));
        let context = LockableContext::with_config(config).unwrap();
        let _held = context.enter().unwrap();

        let other = context.clone();
        let timed_out = thread::spawn(move || other.enter().map(|_| ()).is_err())
            .join()
            .unwrap();
        assert!(timed_out);
    }

    #[test]
    fn test_blocked_enter_proceeds_after_exit() {
        let context = LockableContext::new(1).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let entered = Arc::new(AtomicBool::new(false));

        let scope = context.enter().unwrap();
        let waiter = {
            let context = context.clone();
            let barrier = Arc::clone(&barrier);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                barrier.wait();
                let _scope = context.enter().unwrap();
                entered.store(true, Ordering::SeqCst);
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(30));
        assert!(!entered.load(Ordering::SeqCst));

        drop(scope);
        waiter.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_scope_released_on_panic() {
        let context = LockableContext::new(1).unwrap();
        let other = context.clone();
        let result = thread::spawn(move || {
            let _scope = other.enter().unwrap();
            panic!("inside scope");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(context.active_scopes(), 0);
        assert!(context.try_enter().is_some());
    }

    #[test]
    fn test_scope_ids_unique_across_reuse() {
        let context = LockableContext::new(1).unwrap();
        let first = context.enter().unwrap().id();
        let second = context.enter().unwrap().id();
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first, second);
        assert!(second.version() > first.version());
    }
}
