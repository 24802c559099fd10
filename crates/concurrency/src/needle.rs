//! Lockable needle
//!
//! A mutable cell governed by a [`LockableContext`]. Reads are always
//! allowed and see the latest committed value. Writes require the calling
//! thread to be inside a scope of the needle's context AND that scope to hold
//! the needle's capture.
//!
//! # Capture protocol
//!
//! ```text
//!            capture()                    scope exit / release()
//!   free ───────────────> held(scope) ───────────────────────────> free
//!                           │   ▲
//!     capture() by another  │   │ notify_all, waiters re-contend
//!     scope parks on ───────┘   │
//!     `released` ───────────────┘
//! ```
//!
//! Every commit re-verifies the capture under the value's write lock, so a
//! write can never land after its scope has let go of the needle.
//! [`update`](LockableNeedle::update) composes enter, capture, read, transform
//! and commit; since commits are only possible while captured, updates on one
//! needle are totally ordered.

use crate::context::{LockableContext, Scope, ScopeId, ScopeState};
use needlework_core::{Error, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Outcome of a successful acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquired {
    /// The scope took the capture just now
    Fresh,
    /// The scope already held it
    AlreadyHeld,
}

/// Capture ownership of one needle
pub(crate) struct NeedleLock {
    owner: Mutex<Option<ScopeId>>,
    released: Condvar,
}

impl NeedleLock {
    fn new() -> Self {
        NeedleLock {
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    pub(crate) fn holder(&self) -> Option<ScopeId> {
        *self.owner.lock()
    }

    fn try_acquire(&self, scope: ScopeId) -> Option<Acquired> {
        let mut owner = self.owner.lock();
        match *owner {
            None => {
                *owner = Some(scope);
                Some(Acquired::Fresh)
            }
            Some(held) if held == scope => Some(Acquired::AlreadyHeld),
            Some(_) => None,
        }
    }

    /// Block until `scope` holds the capture; `None` once `deadline` passes
    fn acquire(&self, scope: ScopeId, deadline: Option<Instant>) -> Option<Acquired> {
        let mut owner = self.owner.lock();
        loop {
            match *owner {
                None => {
                    *owner = Some(scope);
                    return Some(Acquired::Fresh);
                }
                Some(held) if held == scope => return Some(Acquired::AlreadyHeld),
                Some(held) => {
                    debug!(
                        target: "needlework::needle",
                        %scope,
                        holder = %held,
                        "Needle contended, waiting"
                    );
                    match deadline {
                        Some(deadline) => {
                            if self.released.wait_until(&mut owner, deadline).timed_out()
                                && matches!(*owner, Some(held) if held != scope)
                            {
                                return None;
                            }
                        }
                        None => self.released.wait(&mut owner),
                    }
                }
            }
        }
    }

    /// Drop the capture if `scope` holds it
    pub(crate) fn release(&self, scope: ScopeId) -> bool {
        let mut owner = self.owner.lock();
        if *owner != Some(scope) {
            return false;
        }
        *owner = None;
        self.released.notify_all();
        trace!(target: "needlework::needle", %scope, "Capture released");
        true
    }
}

struct Committed<T> {
    value: T,
    version: u64,
}

struct NeedleCore<T> {
    committed: RwLock<Committed<T>>,
    lock: Arc<NeedleLock>,
}

/// Scope-guarded mutable cell
///
/// Cloning yields another handle to the same needle.
pub struct LockableNeedle<T> {
    core: Arc<NeedleCore<T>>,
    context: LockableContext,
}

impl<T> LockableNeedle<T> {
    /// Needle governed by `context`, holding `value` at version 0
    pub fn new(context: &LockableContext, value: T) -> Self {
        LockableNeedle {
            core: Arc::new(NeedleCore {
                committed: RwLock::new(Committed { value, version: 0 }),
                lock: Arc::new(NeedleLock::new()),
            }),
            context: context.clone(),
        }
    }

    /// Context whose scopes may write this needle
    pub fn context(&self) -> &LockableContext {
        &self.context
    }

    /// Latest committed value
    pub fn value(&self) -> T
    where
        T: Clone,
    {
        self.core.committed.read().value.clone()
    }

    /// Read the latest committed value in place
    pub fn with_value<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        f(&self.core.committed.read().value)
    }

    /// Number of commits since construction
    pub fn version(&self) -> u64 {
        self.core.committed.read().version
    }

    /// True if any scope holds the capture
    pub fn is_captured(&self) -> bool {
        self.core.lock.holder().is_some()
    }

    /// Capture for the current scope, blocking while another scope holds it
    ///
    /// Waits forever unless the context was configured with a capture timeout.
    /// Capturing a needle the scope already holds is a no-op.
    pub fn capture(&self) -> Result<()> {
        let deadline = self.context.config().capture_timeout();
        self.capture_current(deadline)
    }

    /// Capture for the current scope, giving up after `timeout`
    pub fn capture_timeout(&self, timeout: Duration) -> Result<()> {
        self.capture_current(Some(timeout))
    }

    /// Capture for the current scope only if nobody else holds it
    pub fn try_capture(&self) -> Result<bool> {
        let state = self.context.current_state().ok_or(Error::NotInScope)?;
        match self.core.lock.try_acquire(state.id()) {
            Some(Acquired::Fresh) => {
                state.record_capture(Arc::clone(&self.core.lock));
                Ok(true)
            }
            Some(Acquired::AlreadyHeld) => Ok(true),
            None => Ok(false),
        }
    }

    /// Capture for an explicit scope
    pub fn capture_in(&self, scope: &Scope) -> Result<()> {
        if !self.context.owns(scope) {
            return Err(Error::ForeignScope);
        }
        self.acquire_for(scope.state(), self.context.config().capture_timeout())
    }

    /// True if the current scope holds this needle's capture
    pub fn check(&self) -> bool {
        self.context
            .current_scope()
            .is_some_and(|id| self.core.lock.holder() == Some(id))
    }

    /// True if `scope` holds this needle's capture
    pub fn check_in(&self, scope: &Scope) -> bool {
        self.context.owns(scope) && self.core.lock.holder() == Some(scope.id())
    }

    /// Give up the current scope's capture before the scope exits
    ///
    /// Returns `false` if the current scope did not hold it.
    pub fn release(&self) -> bool {
        let Some(state) = self.context.current_state() else {
            return false;
        };
        let released = self.core.lock.release(state.id());
        if released {
            state.forget_capture(&self.core.lock);
        }
        released
    }

    /// Write a new value
    ///
    /// Fails with [`Error::NotInScope`] outside a scope of this needle's
    /// context and with [`Error::NotCaptured`] if the scope does not hold the
    /// capture. A failed write leaves the value untouched.
    pub fn set(&self, value: T) -> Result<()> {
        let scope = self.context.current_scope().ok_or(Error::NotInScope)?;
        self.commit(scope, value)
    }

    /// Write a new value through an explicit scope
    pub fn set_in(&self, scope: &Scope, value: T) -> Result<()> {
        if !self.context.owns(scope) {
            return Err(Error::ForeignScope);
        }
        self.commit(scope.id(), value)
    }

    /// Atomic read-modify-write
    ///
    /// Enters the context (reusing the thread's scope if there is one),
    /// captures the needle, applies `transform` exactly once to the current
    /// committed value and commits the result, which is also returned.
    /// The capture is held until the scope exits.
    pub fn update<F>(&self, transform: F) -> Result<T>
    where
        F: FnOnce(&T) -> T,
        T: Clone,
    {
        let scope = self.context.enter()?;
        self.capture_in(&scope)?;

        // Nobody else can commit while we hold the capture, so this read is
        // the value our commit replaces.
        let current = self.value();
        let next = transform(&current);
        self.commit(scope.id(), next.clone())?;
        Ok(next)
    }

    fn capture_current(&self, timeout: Option<Duration>) -> Result<()> {
        let state = self.context.current_state().ok_or(Error::NotInScope)?;
        self.acquire_for(&state, timeout)
    }

    fn acquire_for(&self, state: &ScopeState, timeout: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        let deadline = timeout.map(|timeout| started + timeout);
        match self.core.lock.acquire(state.id(), deadline) {
            Some(Acquired::Fresh) => {
                state.record_capture(Arc::clone(&self.core.lock));
                trace!(target: "needlework::needle", scope = %state.id(), "Needle captured");
                Ok(())
            }
            Some(Acquired::AlreadyHeld) => Ok(()),
            None => {
                warn!(
                    target: "needlework::needle",
                    scope = %state.id(),
                    waited = ?started.elapsed(),
                    "Timed out capturing needle"
                );
                Err(Error::Timeout {
                    operation: "capture lockable needle",
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Install `value` if `scope` still holds the capture
    fn commit(&self, scope: ScopeId, value: T) -> Result<()> {
        let mut committed = self.core.committed.write();
        if self.core.lock.holder() != Some(scope) {
            return Err(Error::NotCaptured);
        }
        committed.value = value;
        committed.version += 1;
        trace!(
            target: "needlework::needle",
            %scope,
            version = committed.version,
            "Needle committed"
        );
        Ok(())
    }
}

impl<T> Clone for LockableNeedle<T> {
    fn clone(&self) -> Self {
        LockableNeedle {
            core: Arc::clone(&self.core),
            context: self.context.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for LockableNeedle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let committed = self.core.committed.read();
        f.debug_struct("LockableNeedle")
            .field("value", &committed.value)
            .field("version", &committed.version)
            .field("holder", &self.core.lock.holder())
            .finish()
    }
}
