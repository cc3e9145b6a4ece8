//! Deadline-bound waits on a promise.
//!
//! A [`Barrier`] blocks the calling thread until its promise settles or a
//! deadline passes. Timing out abandons the wait, not the work: the promise
//! may still settle later, and its continuations still run.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::{Error, Outcome, Promise};

/// Result of a bounded wait.
#[derive(Debug, Clone)]
pub enum WaitOutcome<T> {
    /// The promise resolved before the deadline.
    Ready(T),
    /// The promise was rejected before the deadline.
    Failed(Error),
    /// The deadline passed first. The promise may still settle later.
    TimedOut,
}

impl<T> WaitOutcome<T> {
    /// Returns `true` if the deadline passed before the promise settled.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    /// Returns the value if the promise resolved in time.
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }
}

impl<T> From<Outcome<T>> for WaitOutcome<T> {
    fn from(outcome: Outcome<T>) -> Self {
        match outcome {
            Ok(value) => Self::Ready(value),
            Err(e) => Self::Failed(e),
        }
    }
}

struct Slot<T> {
    outcome: Mutex<Option<Outcome<T>>>,
    settled: Condvar,
}

/// Blocking adapter over one [`Promise`].
///
/// Any number of threads may wait on the same barrier; all of them are woken
/// when the promise settles.
///
/// # Examples
///
/// ```
/// use pledge::promise::{Barrier, Promise, WaitOutcome};
/// use std::time::Duration;
///
/// let never: Promise<()> = Promise::new();
/// let outcome = Barrier::new(&never).wait_for(Duration::from_millis(10));
/// assert!(outcome.is_timed_out());
/// ```
pub struct Barrier<T> {
    slot: Arc<Slot<T>>,
}

impl<T: Clone + Send + Sync + 'static> Barrier<T> {
    /// Attaches a barrier to `promise`.
    pub fn new(promise: &Promise<T>) -> Self {
        let slot = Arc::new(Slot {
            outcome: Mutex::new(None),
            settled: Condvar::new(),
        });
        let notify = Arc::clone(&slot);
        promise.on_complete(move |outcome| {
            let mut guard = notify.outcome.lock().unwrap_or_else(PoisonError::into_inner);
            *guard = Some(outcome.clone());
            notify.settled.notify_all();
        });
        Self { slot }
    }

    /// Blocks until the promise settles.
    pub fn wait(&self) -> Outcome<T> {
        let guard = self.slot.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = self
            .slot
            .settled
            .wait_while(guard, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            Some(outcome) => outcome.clone(),
            None => Err(Error::Abandoned),
        }
    }

    /// Blocks until the promise settles or `timeout` elapses, whichever is
    /// first.
    pub fn wait_for(&self, timeout: Duration) -> WaitOutcome<T> {
        let guard = self.slot.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .slot
            .settled
            .wait_timeout_while(guard, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            Some(outcome) => outcome.clone().into(),
            None => WaitOutcome::TimedOut,
        }
    }
}

/// Awaits `promise` for at most `timeout` from async code.
pub async fn wait_for_async<T>(promise: Promise<T>, timeout: Duration) -> WaitOutcome<T>
where
    T: Clone + Send + Sync + 'static,
{
    match tokio::time::timeout(timeout, promise).await {
        Ok(outcome) => outcome.into(),
        Err(_) => WaitOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    const DEADLINE: Duration = Duration::from_millis(400);

    fn resolve_after(promise: &Promise<u32>, delay: Duration, value: u32) {
        let promise = promise.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let _ = promise.resolve(value);
        });
    }

    #[test]
    fn resolves_within_deadline() {
        let promise = Promise::new();
        let barrier = Barrier::new(&promise);
        resolve_after(&promise, DEADLINE / 2, 9);

        let start = Instant::now();
        let outcome = barrier.wait_for(DEADLINE);
        assert!(matches!(outcome, WaitOutcome::Ready(9)));
        assert!(start.elapsed() < DEADLINE);
    }

    #[test]
    fn times_out_at_the_deadline_not_at_resolution() {
        let promise = Promise::new();
        let barrier = Barrier::new(&promise);
        resolve_after(&promise, DEADLINE * 2, 9);

        let start = Instant::now();
        let outcome = barrier.wait_for(DEADLINE);
        let elapsed = start.elapsed();
        assert!(outcome.is_timed_out());
        assert!(elapsed >= DEADLINE);
        assert!(elapsed < DEADLINE * 2, "waited {elapsed:?}");

        // The work was abandoned, not cancelled.
        assert!(matches!(barrier.wait(), Ok(9)));
    }

    #[test]
    fn failure_is_distinct_from_timeout() {
        let promise: Promise<u32> = Promise::new();
        let barrier = Barrier::new(&promise);
        promise.reject(Error::Handler("nope".into())).unwrap();
        assert!(matches!(barrier.wait_for(DEADLINE), WaitOutcome::Failed(Error::Handler(_))));
    }

    #[test]
    fn already_settled_returns_immediately() {
        let promise = Promise::resolved(3u32);
        let barrier = Barrier::new(&promise);
        assert!(matches!(barrier.wait_for(Duration::ZERO), WaitOutcome::Ready(3)));
    }

    #[test]
    fn many_waiters_on_one_aggregate() {
        let inputs: Vec<Promise<u32>> = (0..3).map(|_| Promise::new()).collect();
        let all = super::super::when_all(inputs.clone());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Barrier::new(&all);
                thread::spawn(move || barrier.wait_for(Duration::from_secs(5)).ready())
            })
            .collect();

        for (i, p) in inputs.iter().enumerate() {
            resolve_after(p, Duration::from_millis(20), i as u32);
        }

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Some(vec![0, 1, 2]));
        }
    }

    #[tokio::test]
    async fn async_wait_times_out() {
        let promise: Promise<u32> = Promise::new();
        let outcome = wait_for_async(promise.clone(), Duration::from_millis(50)).await;
        assert!(outcome.is_timed_out());
        promise.resolve(1).unwrap();
    }
}
