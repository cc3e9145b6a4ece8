//! Single-assignment completion cells with chained continuations.
//!
//! A [`Promise`] starts pending and settles exactly once, either resolved
//! with a value or rejected with an [`Error`]. Continuations registered with
//! [`Promise::on_complete`] or [`Promise::then`] run exactly once, in
//! registration order, on whichever thread settles the promise. A
//! continuation registered after settlement runs immediately on the
//! registering thread. A continuation that panics does not stop the ones
//! after it; the first panic is re-raised on the settling thread once all of
//! them have run.
//!
//! Settling a promise twice is a contract violation. It is refused with
//! [`AlreadySettled`] and, in debug builds, panics.
//!
//! [`when_all`] and [`when_any`] combine promises; [`Barrier`] turns a
//! promise into a blocking wait with a deadline.
//!
//! # Examples
//!
//! ```
//! use pledge::promise::{Barrier, FailurePolicy, Promise, WaitOutcome, when_all};
//! use std::time::Duration;
//!
//! let a = Promise::new();
//! let b = Promise::new();
//! let both = when_all([a.clone(), b.clone()]);
//! let doubled = both.then(|v: &Vec<u32>| v.iter().sum::<u32>() * 2, FailurePolicy::Propagate);
//!
//! b.resolve(2).unwrap();
//! a.resolve(1).unwrap();
//!
//! match Barrier::new(&doubled).wait_for(Duration::from_secs(1)) {
//!     WaitOutcome::Ready(total) => assert_eq!(total, 6),
//!     other => panic!("unexpected outcome: {other:?}"),
//! }
//! ```

use std::fmt;
use std::future::{Future, IntoFuture};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{error, warn};

pub use crate::error::{AlreadySettled, Error};

pub mod barrier;

pub use barrier::{Barrier, WaitOutcome, wait_for_async};

/// The settled state of a promise as seen by continuations.
pub type Outcome<T> = Result<T, Error>;

type Continuation<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Settled(Arc<Outcome<T>>),
}

/// What a chained continuation does when the upstream promise is rejected.
///
/// There is deliberately no default: every [`Promise::then`] call site picks
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Reject the chained promise with the same error.
    Propagate,
    /// Log the error at `warn` level and leave the chained promise pending.
    Ignore,
}

/// A single-assignment asynchronous result.
///
/// Cloning a `Promise` yields another handle to the same cell. Any handle may
/// settle it; only the first settlement takes effect.
pub struct Promise<T> {
    inner: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Creates a pending promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Pending(Vec::new()))),
        }
    }

    /// Creates a promise that is already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Settled(Arc::new(Ok(value))))),
        }
    }

    /// Creates a promise that is already rejected with `error`.
    pub fn rejected(error: Error) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Settled(Arc::new(Err(error))))),
        }
    }

    /// Resolves the promise and runs every registered continuation.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadySettled`] if the promise was already resolved or
    /// rejected. The original outcome is kept.
    ///
    /// # Panics
    ///
    /// In debug builds, panics instead of returning [`AlreadySettled`].
    pub fn resolve(&self, value: T) -> Result<(), AlreadySettled> {
        self.settle(Ok(value)).inspect_err(|_| double_settle("resolve"))
    }

    /// Rejects the promise and runs every registered continuation.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadySettled`] if the promise was already resolved or
    /// rejected. The original outcome is kept.
    ///
    /// # Panics
    ///
    /// In debug builds, panics instead of returning [`AlreadySettled`].
    pub fn reject(&self, error: Error) -> Result<(), AlreadySettled> {
        self.settle(Err(error)).inspect_err(|_| double_settle("reject"))
    }

    /// Returns `true` once the promise has resolved or rejected.
    pub fn is_settled(&self) -> bool {
        matches!(*self.lock(), State::Settled(_))
    }

    /// Registers `f` to run exactly once with the final outcome.
    ///
    /// If the promise has already settled, `f` runs before this call returns.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let settled = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending(continuations) => {
                    continuations.push(Box::new(f));
                    return;
                }
                State::Settled(outcome) => Arc::clone(outcome),
            }
        };
        f(&settled);
    }

    /// Chains `f` onto the resolved value, returning a promise for its result.
    ///
    /// On rejection the chained promise follows `policy`.
    pub fn then<U, F>(&self, f: F, policy: FailurePolicy) -> Promise<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let chained = Promise::new();
        let next = chained.clone();
        self.on_complete(move |outcome| match outcome {
            Ok(value) => {
                let _ = next.settle(Ok(f(value)));
            }
            Err(e) => match policy {
                FailurePolicy::Propagate => {
                    let _ = next.settle(Err(e.clone()));
                }
                FailurePolicy::Ignore => {
                    warn!(error = %e, "ignoring rejected promise");
                }
            },
        });
        chained
    }

    /// Settles without logging. Combinators race to settle their output and
    /// losing that race is expected.
    pub(crate) fn settle(&self, outcome: Outcome<T>) -> Result<(), AlreadySettled> {
        let outcome = Arc::new(outcome);
        let continuations = {
            let mut state = self.lock();
            let continuations = match &mut *state {
                State::Settled(_) => return Err(AlreadySettled),
                State::Pending(continuations) => mem::take(continuations),
            };
            *state = State::Settled(Arc::clone(&outcome));
            continuations
        };
        // The lock is released: continuations may settle other promises or
        // register on this one.
        let mut first_panic = None;
        for continuation in continuations {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| continuation(&outcome))) {
                error!("promise continuation panicked");
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn double_settle(op: &str) {
    error!("{op} called on a promise that already settled");
    if cfg!(debug_assertions) {
        panic!("{op} called on a promise that already settled");
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Returns a copy of the outcome if the promise has settled.
    pub fn peek(&self) -> Option<Outcome<T>> {
        match &*self.lock() {
            State::Pending(_) => None,
            State::Settled(outcome) => Some(Outcome::clone(outcome)),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Promise<T> {
    type Output = Outcome<T>;
    type IntoFuture = Pin<Box<dyn Future<Output = Outcome<T>> + Send>>;

    /// Awaits the outcome. Resolves to [`Error::Abandoned`] if every other
    /// handle is dropped while the promise is still pending.
    fn into_future(self) -> Self::IntoFuture {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        drop(self);
        Box::pin(async move { rx.await.unwrap_or(Err(Error::Abandoned)) })
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.lock().unwrap_or_else(PoisonError::into_inner) {
            State::Pending(continuations) => format!("Pending({} continuations)", continuations.len()),
            State::Settled(outcome) => match outcome.as_ref() {
                Ok(_) => "Resolved".to_owned(),
                Err(e) => format!("Rejected({e})"),
            },
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

struct Gather<T> {
    values: Vec<Option<T>>,
    resolved: usize,
}

/// Combines `promises` into one promise for all of their values.
///
/// The output keeps submission order regardless of which input settles
/// first. The first rejection rejects the aggregate immediately; later
/// outcomes are observed but never change it. An empty input resolves to an
/// empty vector.
pub fn when_all<T, I>(promises: I) -> Promise<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let promises: Vec<Promise<T>> = promises.into_iter().collect();
    let aggregate = Promise::new();
    let total = promises.len();

    if total == 0 {
        let _ = aggregate.settle(Ok(Vec::new()));
        return aggregate;
    }

    let gather = Arc::new(Mutex::new(Gather {
        values: (0..total).map(|_| None).collect(),
        resolved: 0,
    }));

    for (index, promise) in promises.iter().enumerate() {
        let gather = Arc::clone(&gather);
        let aggregate = aggregate.clone();
        promise.on_complete(move |outcome| match outcome {
            Ok(value) => {
                let complete = {
                    let mut gather = gather.lock().unwrap_or_else(PoisonError::into_inner);
                    gather.values[index] = Some(value.clone());
                    gather.resolved += 1;
                    (gather.resolved == total)
                        .then(|| gather.values.drain(..).flatten().collect::<Vec<T>>())
                };
                if let Some(values) = complete {
                    let _ = aggregate.settle(Ok(values));
                }
            }
            Err(e) => {
                let _ = aggregate.settle(Err(e.clone()));
            }
        });
    }

    aggregate
}

/// Settles with the first input to settle, tagged with its index.
///
/// An empty input rejects with [`Error::Empty`].
pub fn when_any<T, I>(promises: I) -> Promise<(usize, T)>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let first = Promise::new();
    let mut empty = true;

    for (index, promise) in promises.into_iter().enumerate() {
        empty = false;
        let first = first.clone();
        promise.on_complete(move |outcome| {
            let _ = first.settle(outcome.clone().map(|value| (index, value)));
        });
    }

    if empty {
        let _ = first.settle(Err(Error::Empty));
    }
    first
}
