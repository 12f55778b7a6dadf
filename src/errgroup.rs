//! Fire-and-forget task group that keeps the first error.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::builder::Builder;
use crate::common::Bounded;
use crate::limiter::Limiter;

/// Runs operations concurrently, at most `limit` at a time, and remembers
/// the first one that failed.
///
/// A failure does not cancel operations that are already running. Operations
/// that are admitted after an error or a panic has been recorded are skipped.
/// ```rust
/// use futures_limiter::ErrGroup;
///
/// tokio_test::block_on(async {
///     let group = ErrGroup::new(2);
///     for n in 0..4u32 {
///         group.spawn(async move {
///             if n == 3 {
///                 Err(n)
///             } else {
///                 Ok(())
///             }
///         });
///     }
///     assert_eq!(group.wait().await, Err(3));
///     assert_eq!(group.outstanding(), 0);
/// });
/// ```
pub struct ErrGroup<E> {
    shared: Arc<Shared<E>>,
    limiter: Limiter,
    handle: Handle,
    name: &'static str,
}

struct Shared<E> {
    state: Mutex<State<E>>,
    notify: Notify,
}

struct State<E> {
    outstanding: usize,
    first_error: Option<E>,
    panic: Option<Box<dyn Any + Send + 'static>>,
}

impl<E> ErrGroup<E>
where
    E: Send + 'static,
{
    /// Creates a group running at most `limit` operations at once.
    ///
    /// Panics if `limit` is 0 or if called outside of a tokio runtime.
    pub fn new(limit: usize) -> Self {
        Builder::new(limit).err_group()
    }

    pub(crate) fn from_parts(limiter: Limiter, handle: Handle, name: &'static str) -> Self {
        ErrGroup {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    outstanding: 0,
                    first_error: None,
                    panic: None,
                }),
                notify: Notify::new(),
            }),
            limiter,
            handle,
            name,
        }
    }

    /// Runs `op` in the background once a slot is free.
    ///
    /// If some operation has already failed or panicked by the time `op` is
    /// admitted, `op` is dropped without being polled.
    pub fn spawn<F>(&self, op: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let outstanding = {
            let mut state = self.shared.lock();
            state.outstanding += 1;
            state.outstanding
        };
        tracing::trace!(group = self.name, outstanding, "operation spawned");

        let finished = Finished {
            shared: Arc::clone(&self.shared),
            name: self.name,
        };
        let limiter = self.limiter.clone();

        self.handle.spawn(async move {
            // Locals drop in reverse order: the slot is released before the
            // operation counts as finished.
            let finished = finished;
            let permit = limiter.acquire().await;
            if finished.shared.lock().has_failed() {
                tracing::trace!(group = finished.name, "skipping operation after failure");
                return;
            }

            match AssertUnwindSafe(op).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => finished.record_error(err),
                Err(payload) => finished.record_panic(payload),
            }
            drop(permit);
        });
    }

    /// Waits until every spawned operation has finished, then returns the
    /// first recorded error.
    ///
    /// The error is taken out of the group, so a later `wait` only reports
    /// failures from operations spawned after this one returned. If an
    /// operation panicked, the panic is resumed here instead and any
    /// recorded error is discarded.
    pub async fn wait(&self) -> Result<(), E> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.outstanding == 0 {
                    if let Some(payload) = state.panic.take() {
                        state.first_error = None;
                        drop(state);
                        panic::resume_unwind(payload);
                    }
                    return match state.first_error.take() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
            }

            notified.await;
        }
    }
}

impl<E> ErrGroup<E> {
    /// The number of spawned operations that have not finished yet.
    pub fn outstanding(&self) -> usize {
        self.shared.lock().outstanding
    }
}

impl<E> Bounded for ErrGroup<E> {
    fn limit(&self) -> usize {
        self.limiter.capacity()
    }

    fn in_flight(&self) -> usize {
        self.limiter.in_use()
    }
}

impl<E> fmt::Debug for ErrGroup<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrGroup")
            .field("name", &self.name)
            .field("outstanding", &self.outstanding())
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl<E> Shared<E> {
    fn lock(&self) -> MutexGuard<'_, State<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E> State<E> {
    fn has_failed(&self) -> bool {
        self.first_error.is_some() || self.panic.is_some()
    }
}

/// Marks one operation as finished when dropped, whether it ran, was
/// skipped, or its task was dropped by the runtime.
struct Finished<E> {
    shared: Arc<Shared<E>>,
    name: &'static str,
}

impl<E> Finished<E> {
    fn record_error(&self, err: E) {
        let mut state = self.shared.lock();
        if state.first_error.is_none() {
            tracing::debug!(group = self.name, "recording first error");
            state.first_error = Some(err);
        } else {
            tracing::trace!(group = self.name, "discarding later error");
        }
    }

    fn record_panic(&self, payload: Box<dyn Any + Send + 'static>) {
        tracing::warn!(group = self.name, "operation panicked");
        let mut state = self.shared.lock();
        if state.panic.is_none() {
            state.panic = Some(payload);
        }
    }
}

impl<E> Drop for Finished<E> {
    fn drop(&mut self) {
        let done = {
            let mut state = self.shared.lock();
            state.outstanding -= 1;
            state.outstanding == 0
        };
        if done {
            tracing::trace!(group = self.name, "all operations finished");
            self.shared.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Barrier;

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Failure(usize);

    async fn explode() -> Result<(), Failure> {
        panic!("operation blew up")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wait_returns_error_after_all_complete() {
        const K: usize = 8;
        let group: ErrGroup<Failure> = ErrGroup::new(K);
        let barrier = Arc::new(Barrier::new(K));
        let completed = Arc::new(AtomicUsize::new(0));

        for i in 0..K {
            let barrier = Arc::clone(&barrier);
            let completed = Arc::clone(&completed);
            group.spawn(async move {
                // Every operation is running before the failure is recorded.
                barrier.wait().await;
                if i == 3 {
                    completed.fetch_add(1, Ordering::SeqCst);
                    return Err(Failure(i));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(group.wait().await, Err(Failure(3)));
        assert_eq!(completed.load(Ordering::SeqCst), K);
        assert_eq!(group.outstanding(), 0);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_without_operations() {
        let group: ErrGroup<Failure> = ErrGroup::new(1);
        assert_eq!(group.wait().await, Ok(()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_succeed_with_bounded_concurrency() {
        let group: ErrGroup<Failure> = ErrGroup::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            group.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(group.wait().await, Ok(()));
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_first_error_wins_and_later_ops_are_skipped() {
        // Single-threaded runtime: tasks are admitted in spawn order.
        let group: ErrGroup<Failure> = ErrGroup::new(1);
        let ran_late = Arc::new(AtomicBool::new(false));

        group.spawn(async { Err(Failure(1)) });
        group.spawn(async { Err(Failure(2)) });
        {
            let ran_late = Arc::clone(&ran_late);
            group.spawn(async move {
                ran_late.store(true, Ordering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(group.wait().await, Err(Failure(1)));
        assert!(!ran_late.load(Ordering::SeqCst));

        // The error was taken; the group is usable again.
        group.spawn(async { Ok(()) });
        assert_eq!(group.wait().await, Ok(()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_resumes_on_wait() {
        let group: ErrGroup<Failure> = ErrGroup::new(2);
        group.spawn(explode());
        group.spawn(async { Ok(()) });

        let result = AssertUnwindSafe(group.wait()).catch_unwind().await;
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"operation blew up"));
        assert_eq!(group.outstanding(), 0);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_discards_recorded_error() {
        let group: ErrGroup<Failure> = ErrGroup::new(2);
        let barrier = Arc::new(Barrier::new(2));
        {
            // Both operations are running before either one fails.
            let barrier = Arc::clone(&barrier);
            group.spawn(async move {
                barrier.wait().await;
                explode().await
            });
        }
        group.spawn(async move {
            barrier.wait().await;
            Err(Failure(7))
        });

        let result = AssertUnwindSafe(group.wait()).catch_unwind().await;
        assert!(result.is_err());
        assert_eq!(group.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_operations_skipped_after_panic() {
        // Single-threaded runtime: tasks are admitted in spawn order.
        let group: ErrGroup<Failure> = ErrGroup::new(1);
        let ran_late = Arc::new(AtomicBool::new(false));

        group.spawn(explode());
        {
            let ran_late = Arc::clone(&ran_late);
            group.spawn(async move {
                ran_late.store(true, Ordering::SeqCst);
                Ok(())
            });
        }

        let result = AssertUnwindSafe(group.wait()).catch_unwind().await;
        assert!(result.is_err());
        assert!(!ran_late.load(Ordering::SeqCst));
        assert_eq!(group.outstanding(), 0);
    }
}
