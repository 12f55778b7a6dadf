//! Ordered, concurrently executing work queue.
//!
//! Every pushed input is transformed in its own task, at most `limit` at a
//! time, while outputs are handed back strictly in push order. A finished
//! item waits behind any earlier item that is still running (head-of-line
//! blocking); the queue never reorders.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use futures::ready;
use futures::stream::{self, Stream};
use pin_project::pin_project;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::builder::Builder;
use crate::common::Bounded;
use crate::limiter::{Limiter, Permit};

/// Payload resumed on the consumer when a worker was dropped before its
/// transform finished, e.g. because the runtime shut down.
const ABANDONED: &str = "ordered queue worker was dropped before completing";

type Transform<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, O> + Send + Sync>;

/// A FIFO queue whose items are processed concurrently.
///
/// `push` never waits: it records the item and spawns a worker that first
/// waits for a [`Limiter`] slot, then runs the transform. `pop` and
/// `pop_wait` only ever look at the oldest item, so outputs come back in
/// exactly the order inputs went in, no matter which worker finishes first.
///
/// Cloning the queue yields another handle to the same items.
///
/// If a transform panics, its slot is released and the panic is resumed on
/// whichever consumer pops that item.
/// ```rust
/// use futures_limiter::OrderedQueue;
///
/// tokio_test::block_on(async {
///     let queue = OrderedQueue::new(4, |n: u64| async move { n * 10 });
///     for n in 0..8 {
///         queue.push(n);
///     }
///
///     let mut outputs = Vec::new();
///     while let Some(out) = queue.pop_wait().await {
///         outputs.push(out);
///     }
///     assert_eq!(outputs, vec![0, 10, 20, 30, 40, 50, 60, 70]);
///     assert!(queue.is_empty());
/// });
/// ```
pub struct OrderedQueue<I, O> {
    shared: Arc<Shared<O>>,
    transform: Transform<I, O>,
    limiter: Limiter,
    handle: Handle,
    name: &'static str,
}

struct Shared<O> {
    state: Mutex<State<O>>,
    notify: Notify,
}

/// Items that were pushed but not yet popped, oldest first.
///
/// `slots[k]` belongs to sequence number `head + k` and is `Some` once its
/// worker has finished.
struct State<O> {
    head: u64,
    slots: VecDeque<Option<std::thread::Result<O>>>,
}

enum Head<O> {
    Ready(std::thread::Result<O>),
    Pending,
    Empty,
}

// ===== impl OrderedQueue =====

impl<I, O> OrderedQueue<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Creates a queue running at most `limit` transforms at once.
    ///
    /// Workers are spawned on the runtime this is called from.
    ///
    /// Panics if `limit` is 0 or if called outside of a tokio runtime.
    pub fn new<F, Fut>(limit: usize, transform: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        Builder::new(limit).queue(transform)
    }

    /// Creates a queue that draws its slots from an existing limiter,
    /// sharing the concurrency budget with everything else using it.
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn with_limiter<F, Fut>(limiter: Limiter, transform: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        Builder::with_limiter(limiter).queue(transform)
    }

    pub(crate) fn from_parts<F, Fut>(
        limiter: Limiter,
        handle: Handle,
        name: &'static str,
        transform: F,
    ) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        let transform: Transform<I, O> = Arc::new(move |input: I| transform(input).boxed());
        OrderedQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    head: 0,
                    slots: VecDeque::new(),
                }),
                notify: Notify::new(),
            }),
            transform,
            limiter,
            handle,
            name,
        }
    }

    /// Appends `input` and starts processing it in the background.
    ///
    /// Returns immediately; the spawned worker is the one that waits for a
    /// limiter slot.
    pub fn push(&self, input: I) {
        let seq = self.shared.lock().reserve();
        tracing::trace!(queue = self.name, seq, "item pushed");

        // Created before spawning so that a worker dropped unpolled still
        // completes its slot.
        let completion = Completion {
            seq,
            shared: Some(Arc::clone(&self.shared)),
            name: self.name,
        };
        let limiter = self.limiter.clone();
        let transform = Arc::clone(&self.transform);
        let name = self.name;

        self.handle.spawn(async move {
            let permit = limiter.acquire().await;
            tracing::trace!(queue = name, seq, "worker admitted");
            let work = AssertUnwindSafe(async move { transform(input).await }).catch_unwind();
            Worker {
                inner: work,
                permit: Some(permit),
                completion: Some(completion),
            }
            .await
        });
    }
}

impl<I, O> OrderedQueue<I, O> {
    /// Removes and returns the oldest output if it is ready.
    ///
    /// Never waits. Returns `None` both when nothing is queued and when the
    /// oldest item is still running, even if later items have finished.
    pub fn pop(&self) -> Option<O> {
        match self.shared.take_head() {
            Head::Ready(outcome) => Some(self.unwrap_outcome(outcome)),
            Head::Pending | Head::Empty => None,
        }
    }

    /// Waits for the oldest item to finish, then removes and returns its
    /// output.
    ///
    /// Returns `None` as soon as the queue holds no items.
    pub async fn pop_wait(&self) -> Option<O> {
        loop {
            // Register interest before looking at the head so a completion
            // landing in between is not missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.shared.take_head() {
                Head::Ready(outcome) => return Some(self.unwrap_outcome(outcome)),
                Head::Empty => return None,
                Head::Pending => notified.await,
            }
        }
    }

    /// A stream of outputs in push order, ending once the queue is empty.
    pub fn outputs(&self) -> impl Stream<Item = O> + Send + 'static
    where
        I: 'static,
        O: Send + 'static,
    {
        stream::unfold(self.clone(), |queue| async move {
            let out = queue.pop_wait().await?;
            Some((out, queue))
        })
    }

    /// The number of items pushed but not yet popped.
    pub fn len(&self) -> usize {
        self.shared.lock().slots.len()
    }

    /// Returns `true` if every pushed item has been popped.
    pub fn is_empty(&self) -> bool {
        self.shared.lock().slots.is_empty()
    }

    /// Returns `true` if `pop` would return an output right now.
    pub fn is_ready(&self) -> bool {
        matches!(self.shared.lock().slots.front(), Some(Some(_)))
    }

    /// The limiter this queue draws its slots from.
    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    fn unwrap_outcome(&self, outcome: std::thread::Result<O>) -> O {
        match outcome {
            Ok(out) => out,
            Err(payload) => {
                tracing::trace!(queue = self.name, "resuming transform panic on consumer");
                panic::resume_unwind(payload)
            }
        }
    }
}

impl<I, O> Bounded for OrderedQueue<I, O> {
    fn limit(&self) -> usize {
        self.limiter.capacity()
    }

    fn in_flight(&self) -> usize {
        self.limiter.in_use()
    }
}

impl<I, O> Clone for OrderedQueue<I, O> {
    fn clone(&self) -> Self {
        OrderedQueue {
            shared: Arc::clone(&self.shared),
            transform: Arc::clone(&self.transform),
            limiter: self.limiter.clone(),
            handle: self.handle.clone(),
            name: self.name,
        }
    }
}

impl<I, O> fmt::Debug for OrderedQueue<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("limiter", &self.limiter)
            .finish()
    }
}

// ===== impl Shared =====

impl<O> Shared<O> {
    fn lock(&self) -> MutexGuard<'_, State<O>> {
        // No user code runs under this lock, so a poisoned guard still
        // holds consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_head(&self) -> Head<O> {
        let head = self.lock().pop_ready();
        if let Head::Ready(_) = head {
            // Another consumer may be waiting on the new head.
            self.notify.notify_waiters();
        }
        head
    }

    fn finish(&self, seq: u64, outcome: std::thread::Result<O>) {
        {
            let mut state = self.lock();
            let index = (seq - state.head) as usize;
            if let Some(slot) = state.slots.get_mut(index) {
                *slot = Some(outcome);
            }
        }
        self.notify.notify_waiters();
    }
}

// ===== impl State =====

impl<O> State<O> {
    /// Appends an empty slot, returning its sequence number.
    fn reserve(&mut self) -> u64 {
        let seq = self.head + self.slots.len() as u64;
        self.slots.push_back(None);
        seq
    }

    fn pop_ready(&mut self) -> Head<O> {
        match self.slots.front() {
            None => return Head::Empty,
            Some(None) => return Head::Pending,
            Some(Some(_)) => {}
        }
        self.head += 1;
        match self.slots.pop_front() {
            Some(Some(outcome)) => Head::Ready(outcome),
            _ => unreachable!("front slot was checked to be complete"),
        }
    }
}

// ===== Worker =====

/// Drives one transform, releasing its permit before publishing the output.
#[pin_project]
struct Worker<F, O> {
    #[pin]
    inner: F,
    permit: Option<Permit>,
    completion: Option<Completion<O>>,
}

impl<F, O> Future for Worker<F, O>
where
    F: Future<Output = std::thread::Result<O>>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        let outcome = ready!(this.inner.poll(cx));
        drop(this.permit.take());
        if let Some(completion) = this.completion.take() {
            completion.complete(outcome);
        }
        Poll::Ready(())
    }
}

/// Publishes a worker's outcome into its slot exactly once.
///
/// If dropped without completing, the slot is filled with a panic payload
/// so consumers are not left waiting on it forever.
struct Completion<O> {
    seq: u64,
    shared: Option<Arc<Shared<O>>>,
    name: &'static str,
}

impl<O> Completion<O> {
    fn complete(mut self, outcome: std::thread::Result<O>) {
        if outcome.is_err() {
            tracing::warn!(queue = self.name, seq = self.seq, "transform panicked");
        } else {
            tracing::trace!(queue = self.name, seq = self.seq, "item completed");
        }
        if let Some(shared) = self.shared.take() {
            shared.finish(self.seq, outcome);
        }
    }
}

impl<O> Drop for Completion<O> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            tracing::warn!(queue = self.name, seq = self.seq, "worker abandoned");
            shared.finish(self.seq, Err(Box::new(ABANDONED)));
        }
    }
}
