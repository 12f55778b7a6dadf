//! Typed send/receive group over an [`OrderedQueue`].
//!
//! Each input is transformed into a `Result<O, E>`. Receiving walks the
//! results in send order and stops at the first error.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use crate::builder::Builder;
use crate::common::Bounded;
use crate::queue::OrderedQueue;

/// Sends inputs to be processed concurrently and receives their results in
/// send order.
///
/// Cloning the group yields another handle to the same pending results.
/// ```rust
/// use futures_limiter::Group;
///
/// tokio_test::block_on(async {
///     let group = Group::new(3, |n: u32| async move {
///         if n == 13 {
///             Err(format!("unlucky {}", n))
///         } else {
///             Ok(n + 1)
///         }
///     });
///     for n in [1, 2, 13, 4] {
///         group.send(n);
///     }
///
///     let mut received = Vec::new();
///     let result = group
///         .recv(true, |n| {
///             received.push(n);
///             Ok(())
///         })
///         .await;
///     assert_eq!(result, Err("unlucky 13".to_string()));
///     assert_eq!(received, vec![2, 3]);
///
///     // The result for `4` is still pending.
///     assert_eq!(group.pending(), 1);
///     group.drain().await;
///     assert_eq!(group.pending(), 0);
/// });
/// ```
pub struct Group<I, O, E> {
    queue: OrderedQueue<I, Result<O, E>>,
    name: &'static str,
}

impl<I, O, E> Group<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    /// Creates a group running at most `limit` transforms at once.
    ///
    /// Panics if `limit` is 0 or if called outside of a tokio runtime.
    pub fn new<F, Fut>(limit: usize, transform: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        Builder::new(limit).group(transform)
    }

    pub(crate) fn from_queue(queue: OrderedQueue<I, Result<O, E>>, name: &'static str) -> Self {
        Group { queue, name }
    }

    /// Queues `input` for processing. Never waits.
    pub fn send(&self, input: I) {
        self.queue.push(input);
    }
}

impl<I, O, E> Group<I, O, E> {
    /// Receives results in send order, handing each output to `on_result`.
    ///
    /// With `wait` set, waits for each result in turn until nothing is
    /// pending; otherwise stops at the first result that is not ready yet.
    ///
    /// Stops at the first failed result, or the first error returned by
    /// `on_result`, and returns it. Results after that one stay pending;
    /// call [`drain`](Group::drain) to discard them.
    pub async fn recv<C>(&self, wait: bool, mut on_result: C) -> Result<(), E>
    where
        C: FnMut(O) -> Result<(), E>,
    {
        if !wait {
            return self.try_recv(on_result);
        }
        while let Some(result) = self.queue.pop_wait().await {
            self.deliver(result, &mut on_result)?;
        }
        Ok(())
    }

    /// Receives every result that is ready right now, without waiting.
    ///
    /// Same as `recv(false, on_result)`.
    pub fn try_recv<C>(&self, mut on_result: C) -> Result<(), E>
    where
        C: FnMut(O) -> Result<(), E>,
    {
        while let Some(result) = self.queue.pop() {
            self.deliver(result, &mut on_result)?;
        }
        Ok(())
    }

    /// Waits for every pending result and discards it.
    ///
    /// When this returns no work sent before the call is still running and
    /// [`pending`](Group::pending) is zero, unless sends raced with it.
    /// Panics from discarded transforms are logged and swallowed.
    pub async fn drain(&self) {
        loop {
            match AssertUnwindSafe(self.queue.pop_wait()).catch_unwind().await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(group = self.name, "discarding panicked result while draining");
                }
            }
        }
        tracing::trace!(group = self.name, "group drained");
    }

    /// The number of sent inputs whose results have not been received.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn deliver<C>(&self, result: Result<O, E>, on_result: &mut C) -> Result<(), E>
    where
        C: FnMut(O) -> Result<(), E>,
    {
        match result {
            Ok(out) => on_result(out),
            Err(err) => {
                tracing::debug!(
                    group = self.name,
                    pending = self.pending(),
                    "stopping receive at failed result"
                );
                Err(err)
            }
        }
    }
}

impl<I, O, E> Bounded for Group<I, O, E> {
    fn limit(&self) -> usize {
        self.queue.limit()
    }

    fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }
}

impl<I, O, E> Clone for Group<I, O, E> {
    fn clone(&self) -> Self {
        Group {
            queue: self.queue.clone(),
            name: self.name,
        }
    }
}

impl<I, O, E> fmt::Debug for Group<I, O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .field("limiter", self.queue.limiter())
            .finish()
    }
}
