//! Counting admission gate.
//!
//! A [`Limiter`] bounds how many operations may be in flight at once.
//! Admission hands out a [`Permit`]; the slot is given back when the permit
//! is released or dropped, so a permit held across a panic or a cancelled
//! task is still returned to the gate.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::common::Bounded;

const NEVER_CLOSED: &str = "Limiter semaphore is never closed, so acquiring should never fail";

/// Limits the number of concurrent operations.
///
/// Cloning a `Limiter` is cheap and yields a handle to the same gate, which
/// is how several queues or groups can share one concurrency budget.
///
/// Waiters are not guaranteed to be admitted in the order they arrived.
#[derive(Clone)]
pub struct Limiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A single admission granted by a [`Limiter`].
///
/// Dropping the permit releases the slot. Each permit releases exactly
/// once, so an unbalanced release cannot be expressed.
#[must_use = "dropping a permit releases its slot immediately"]
pub struct Permit {
    _inner: OwnedSemaphorePermit,
}

impl Limiter {
    /// Returns a new `Limiter`. `capacity` is the maximum number of
    /// concurrent operations.
    ///
    /// Panics if `capacity` is 0.
    /// ```rust
    /// use futures_limiter::Limiter;
    ///
    /// let limiter = Limiter::new(2);
    ///
    /// tokio_test::block_on(async move {
    ///     let first = limiter.acquire().await;
    ///     let _second = limiter.acquire().await;
    ///     assert!(limiter.try_acquire().is_none());
    ///
    ///     first.release();
    ///     assert!(limiter.try_acquire().is_some());
    /// });
    /// ```
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than 0");
        Limiter {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Begin an operation, waiting until fewer than `capacity` operations
    /// are admitted.
    pub async fn acquire(&self) -> Permit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect(NEVER_CLOSED);
        Permit { _inner: permit }
    }

    /// Begin an operation if a slot is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(Permit { _inner: permit }),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => unreachable!("{}", NEVER_CLOSED),
        }
    }

    /// Begin an operation from a thread that is not driving an async
    /// runtime, parking it until a slot is free.
    ///
    /// Must not be called from within an async task.
    pub fn acquire_blocking(&self) -> Permit {
        futures::executor::block_on(self.acquire())
    }

    /// The fixed number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

impl Bounded for Limiter {
    fn limit(&self) -> usize {
        self.capacity
    }

    fn in_flight(&self) -> usize {
        self.in_use()
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

impl Permit {
    /// End the operation. Equivalent to dropping the permit.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit").finish()
    }
}
