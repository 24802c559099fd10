//! Lazy memoizing needle
//!
//! [`LazyNeedle`] runs a factory at most once per initialization round and
//! hands every caller the same outcome.
//!
//! ```text
//! Uninitialized ──(winner)──> Initializing(owner) ──ok──> Completed(value)
//!       ^                              │
//!       └──── fault, not cached ───────┤
//!                                      └──fault, cached──> Faulted(error)
//! ```
//!
//! # Semantics
//!
//! - The first caller to find the cell uninitialized becomes the winner and
//!   runs the factory outside the lock. Everyone else blocks until the round
//!   resolves and then observes the winner's value or error.
//! - If the factory re-enters the same cell on the winning thread, the inner
//!   call fails immediately with [`LazyError::Reentrant`] instead of deadlocking.
//! - Faults are retried on the next access unless the cell was built with
//!   `cache_faults`, in which case the error is kept and returned forever.
//! - A factory that panics leaves the cell uninitialized and wakes all waiters.
//! - `set` overwrites whatever is there. A round still in flight when `set`
//!   lands has its result discarded.
//!
//! Each round is numbered by a generation counter. Waiters remember the
//! generation they waited on, which is how they receive a non-cached fault that
//! was never stored in the cell itself.

use needlework_core::LazyConfig;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::convert::Infallible;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Failure of a lazy needle access
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LazyError<E> {
    /// The factory tried to read its own cell before returning
    #[error("Invalid operation: reentrant initialization of lazy needle")]
    Reentrant,

    /// The factory failed; the original error is returned as is
    #[error("Lazy needle factory failed: {0}")]
    Fault(E),

    /// Gave up waiting for another thread's initialization round
    #[error("Timed out waiting for lazy needle initialization")]
    TimedOut,

    /// The cell was reset but was built from a value, not a factory
    #[error("Lazy needle has no value and no factory")]
    NoFactory,
}

impl<E> LazyError<E> {
    /// True for contract violations (reentrancy)
    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, LazyError::Reentrant)
    }

    /// The factory's error, if this is a fault
    pub fn into_fault(self) -> Option<E> {
        match self {
            LazyError::Fault(error) => Some(error),
            _ => None,
        }
    }
}

type Factory<T, E> = Box<dyn Fn() -> Result<T, E> + Send + Sync>;

enum CellState<T, E> {
    Uninitialized,
    Initializing { owner: ThreadId },
    Completed(T),
    Faulted(E),
}

impl<T, E> CellState<T, E> {
    fn name(&self) -> &'static str {
        match self {
            CellState::Uninitialized => "Uninitialized",
            CellState::Initializing { .. } => "Initializing",
            CellState::Completed(_) => "Completed",
            CellState::Faulted(_) => "Faulted",
        }
    }

    fn is_resolved(&self) -> bool {
        matches!(self, CellState::Completed(_) | CellState::Faulted(_))
    }
}

struct Inner<T, E> {
    state: CellState<T, E>,
    /// Bumped whenever a round starts or the state is overwritten
    generation: u64,
    /// Bumped whenever a round resolves (success, fault, panic, set)
    resolutions: u64,
    /// Non-cached fault of a finished round, for that round's waiters
    last_fault: Option<(u64, E)>,
    faulted: bool,
}

struct Shared<T, E> {
    inner: Mutex<Inner<T, E>>,
    resolved: Condvar,
    factory: Option<Factory<T, E>>,
    config: LazyConfig,
}

/// Thread-safe lazily computed value
///
/// `T` and `E` are cloned out to callers; wrap them in `Arc` if cloning is
/// expensive.
pub struct LazyNeedle<T, E = Infallible> {
    // Boxed so the cell has a stable address to use as its identity
    shared: Box<Shared<T, E>>,
}

impl<T> LazyNeedle<T, Infallible> {
    /// Lazy needle over an infallible factory
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::try_new(move || Ok(factory()))
    }
}

impl<T, E> LazyNeedle<T, E> {
    /// Lazy needle over a fallible factory; faults are retried
    pub fn try_new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        Self::with_config(factory, LazyConfig::default())
    }

    /// Lazy needle over a fallible factory with explicit fault caching
    pub fn with_config<F>(factory: F, config: LazyConfig) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        Self::build(CellState::Uninitialized, Some(Box::new(factory)), config)
    }

    /// Already completed needle; no factory is ever run
    pub fn with_value(value: T) -> Self {
        Self::build(CellState::Completed(value), None, LazyConfig::default())
    }

    fn build(state: CellState<T, E>, factory: Option<Factory<T, E>>, config: LazyConfig) -> Self {
        LazyNeedle {
            shared: Box::new(Shared {
                inner: Mutex::new(Inner {
                    state,
                    generation: 0,
                    resolutions: 0,
                    last_fault: None,
                    faulted: false,
                }),
                resolved: Condvar::new(),
                factory,
                config,
            }),
        }
    }

    fn identity(&self) -> usize {
        &*self.shared as *const Shared<T, E> as usize
    }

    /// The value, running the factory if nobody has yet
    pub fn value(&self) -> Result<T, LazyError<E>>
    where
        T: Clone,
        E: Clone,
    {
        self.resolve(None)
    }

    /// As [`value`](Self::value), but give up waiting on another thread's
    /// round after `timeout`
    ///
    /// Timing out leaves the cell untouched. The winner never times out: a
    /// caller that ends up running the factory waits for it regardless.
    pub fn value_timeout(&self, timeout: Duration) -> Result<T, LazyError<E>>
    where
        T: Clone,
        E: Clone,
    {
        self.resolve(Some(Instant::now() + timeout))
    }

    /// Run the factory if needed, discarding the value
    pub fn initialize(&self) -> Result<(), LazyError<E>>
    where
        T: Clone,
        E: Clone,
    {
        self.value().map(drop)
    }

    fn resolve(&self, deadline: Option<Instant>) -> Result<T, LazyError<E>>
    where
        T: Clone,
        E: Clone,
    {
        let me = thread::current().id();
        let mut inner = self.shared.inner.lock();
        loop {
            let must_wait = match &inner.state {
                CellState::Completed(value) => return Ok(value.clone()),
                CellState::Faulted(error) => return Err(LazyError::Fault(error.clone())),
                CellState::Initializing { owner } if *owner == me => {
                    return Err(LazyError::Reentrant);
                }
                CellState::Initializing { .. } => true,
                CellState::Uninitialized => false,
            };

            if must_wait {
                let generation = inner.generation;
                self.wait_round(&mut inner, generation, deadline)?;
                if let Some((faulted_generation, error)) = &inner.last_fault {
                    if *faulted_generation == generation {
                        return Err(LazyError::Fault(error.clone()));
                    }
                }
            } else if let Some(outcome) = self.run_factory(&mut inner, me)? {
                return outcome;
            }
        }
    }

    /// Block until the round numbered `generation` is over
    fn wait_round(
        &self,
        inner: &mut MutexGuard<'_, Inner<T, E>>,
        generation: u64,
        deadline: Option<Instant>,
    ) -> Result<(), LazyError<E>> {
        while inner.generation == generation
            && matches!(inner.state, CellState::Initializing { .. })
        {
            match deadline {
                Some(deadline) => {
                    if self.shared.resolved.wait_until(inner, deadline).timed_out()
                        && inner.generation == generation
                        && matches!(inner.state, CellState::Initializing { .. })
                    {
                        warn!(
                            target: "needlework::lazy",
                            generation,
                            "Timed out waiting for initialization"
                        );
                        return Err(LazyError::TimedOut);
                    }
                }
                None => self.shared.resolved.wait(inner),
            }
        }
        Ok(())
    }

    /// Win the round: run the factory unlocked and commit its outcome
    ///
    /// Returns `Ok(None)` when the round was overtaken by `set`/`reset` and
    /// the caller should re-evaluate the state.
    #[allow(clippy::type_complexity)]
    fn run_factory(
        &self,
        inner: &mut MutexGuard<'_, Inner<T, E>>,
        me: ThreadId,
    ) -> Result<Option<Result<T, LazyError<E>>>, LazyError<E>>
    where
        T: Clone,
        E: Clone,
    {
        let factory = self.shared.factory.as_ref().ok_or(LazyError::NoFactory)?;

        inner.generation += 1;
        let generation = inner.generation;
        inner.state = CellState::Initializing { owner: me };
        debug!(target: "needlework::lazy", generation, "Initialization started");

        let outcome = MutexGuard::unlocked(inner, || {
            let _abort = AbortGuard {
                shared: &self.shared,
                generation,
            };
            factory()
        });

        if inner.generation != generation {
            debug!(
                target: "needlework::lazy",
                generation,
                "Initialization overtaken, result discarded"
            );
            return Ok(None);
        }

        inner.resolutions += 1;
        let result = match outcome {
            Ok(value) => {
                inner.state = CellState::Completed(value.clone());
                inner.faulted = false;
                inner.last_fault = None;
                Ok(value)
            }
            Err(error) => {
                inner.faulted = true;
                if self.shared.config.cache_faults {
                    inner.state = CellState::Faulted(error.clone());
                } else {
                    inner.state = CellState::Uninitialized;
                    inner.last_fault = Some((generation, error.clone()));
                }
                Err(LazyError::Fault(error))
            }
        };
        self.shared.resolved.notify_all();
        Ok(Some(result))
    }

    /// Overwrite the cell with a completed value
    pub fn set(&self, value: T) {
        let mut inner = self.shared.inner.lock();
        inner.generation += 1;
        inner.resolutions += 1;
        inner.state = CellState::Completed(value);
        inner.faulted = false;
        inner.last_fault = None;
        self.shared.resolved.notify_all();
    }

    /// Return the cell to uninitialized, yielding the previous value
    ///
    /// The next access runs the factory again. A round in flight is abandoned
    /// (its result will be discarded).
    pub fn reset(&self) -> Option<T> {
        let mut inner = self.shared.inner.lock();
        inner.generation += 1;
        inner.faulted = false;
        inner.last_fault = None;
        let previous = std::mem::replace(&mut inner.state, CellState::Uninitialized);
        self.shared.resolved.notify_all();
        match previous {
            CellState::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// The value if already computed; never runs the factory
    pub fn try_get(&self) -> Option<T>
    where
        T: Clone,
    {
        match &self.shared.inner.lock().state {
            CellState::Completed(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// True if the cell currently holds a value
    pub fn is_alive(&self) -> bool {
        matches!(self.shared.inner.lock().state, CellState::Completed(_))
    }

    /// True once the cell holds a value or a cached fault
    pub fn is_completed(&self) -> bool {
        self.shared.inner.lock().state.is_resolved()
    }

    /// True if the most recent round ended in a fault
    pub fn is_faulted(&self) -> bool {
        self.shared.inner.lock().faulted
    }

    /// Block until the cell is completed or the next round resolves
    ///
    /// Does not start initialization itself. Calling this from inside the
    /// factory would wait on itself and fails with [`LazyError::Reentrant`].
    pub fn wait(&self) -> Result<(), LazyError<E>> {
        self.wait_resolution(None)
    }

    /// As [`wait`](Self::wait) with an upper bound
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), LazyError<E>> {
        self.wait_resolution(Some(Instant::now() + timeout))
    }

    fn wait_resolution(&self, deadline: Option<Instant>) -> Result<(), LazyError<E>> {
        let me = thread::current().id();
        let mut inner = self.shared.inner.lock();
        if matches!(inner.state, CellState::Initializing { owner } if owner == me) {
            return Err(LazyError::Reentrant);
        }
        let seen = inner.resolutions;
        while !inner.state.is_resolved() && inner.resolutions == seen {
            match deadline {
                Some(deadline) => {
                    if self.shared.resolved.wait_until(&mut inner, deadline).timed_out()
                        && inner.resolutions == seen
                        && !inner.state.is_resolved()
                    {
                        return Err(LazyError::TimedOut);
                    }
                }
                None => self.shared.resolved.wait(&mut inner),
            }
        }
        Ok(())
    }
}

/// Rolls an in-flight round back to uninitialized if the factory panics
struct AbortGuard<'a, T, E> {
    shared: &'a Shared<T, E>,
    generation: u64,
}

impl<T, E> Drop for AbortGuard<'_, T, E> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        // `MutexGuard::unlocked` re-locks only after this guard is gone, so
        // the lock is free here.
        let mut inner = self.shared.inner.lock();
        if inner.generation == self.generation
            && matches!(inner.state, CellState::Initializing { .. })
        {
            warn!(
                target: "needlework::lazy",
                generation = self.generation,
                "Factory panicked, cell reset"
            );
            inner.state = CellState::Uninitialized;
            inner.resolutions += 1;
            self.shared.resolved.notify_all();
        }
    }
}

impl<T, E> Hash for LazyNeedle<T, E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl<T, E> PartialEq for LazyNeedle<T, E> {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl<T, E> Eq for LazyNeedle<T, E> {}

impl<T, E> fmt::Debug for LazyNeedle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("LazyNeedle")
            .field("state", &inner.state.name())
            .field("generation", &inner.generation)
            .field("faulted", &inner.faulted)
            .finish()
    }
}
