//! Configuration shared by every queue and group constructor.

use std::future::Future;

use tokio::runtime::Handle;

use crate::errgroup::ErrGroup;
use crate::group::Group;
use crate::limiter::Limiter;
use crate::queue::OrderedQueue;

const DEFAULT_NAME: &str = "futures_limiter";

/// Configures and constructs queues and groups.
///
/// ```rust
/// use futures_limiter::Builder;
///
/// tokio_test::block_on(async {
///     let queue = Builder::new(2)
///         .name("doubler")
///         .queue(|n: u32| async move { n * 2 });
///     queue.push(21);
///     assert_eq!(queue.pop_wait().await, Some(42));
/// });
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    limiter: Limiter,
    handle: Option<Handle>,
    name: &'static str,
}

impl Builder {
    /// Starts a configuration with a fresh limiter of `limit` slots.
    ///
    /// Panics if `limit` is 0.
    pub fn new(limit: usize) -> Self {
        Self::with_limiter(Limiter::new(limit))
    }

    /// Starts a configuration drawing slots from an existing limiter.
    pub fn with_limiter(limiter: Limiter) -> Self {
        Builder {
            limiter,
            handle: None,
            name: DEFAULT_NAME,
        }
    }

    /// Spawn workers on `handle` instead of the runtime the terminal
    /// constructor is called from.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Name recorded on every tracing event emitted by the built value.
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Builds an [`OrderedQueue`] running `transform` on every input.
    ///
    /// Panics if no handle was configured and this is called outside of a
    /// tokio runtime.
    pub fn queue<I, O, F, Fut>(self, transform: F) -> OrderedQueue<I, O>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        let handle = self.runtime();
        OrderedQueue::from_parts(self.limiter, handle, self.name, transform)
    }

    /// Builds a typed [`Group`] running `transform` on every sent input.
    ///
    /// Panics if no handle was configured and this is called outside of a
    /// tokio runtime.
    pub fn group<I, O, E, F, Fut>(self, transform: F) -> Group<I, O, E>
    where
        I: Send + 'static,
        O: Send + 'static,
        E: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        let name = self.name;
        Group::from_queue(self.queue(transform), name)
    }

    /// Builds an error-collecting [`ErrGroup`].
    ///
    /// Panics if no handle was configured and this is called outside of a
    /// tokio runtime.
    pub fn err_group<E>(self) -> ErrGroup<E>
    where
        E: Send + 'static,
    {
        let handle = self.runtime();
        ErrGroup::from_parts(self.limiter, handle, self.name)
    }

    fn runtime(&self) -> Handle {
        match &self.handle {
            Some(handle) => handle.clone(),
            None => Handle::current(),
        }
    }
}
