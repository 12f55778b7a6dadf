//! Bounded concurrency primitives with ordered results
//!
//! This crate provides a counting admission gate ([`Limiter`]), a work queue
//! that runs its items concurrently but hands outputs back strictly in the
//! order the inputs were pushed ([`OrderedQueue`]), and two groups built on
//! top of them: a typed send/receive [`Group`] that stops at the first failed
//! result, and a fire-and-forget [`ErrGroup`] that keeps the first error.
//!
//! Every pushed item gets its own tokio task. Only `limit` of those tasks
//! run their transform at any given time; the rest wait for a slot. Outputs
//! are retrieved from the head of the queue only, so a slow early item holds
//! back later items that already finished. That is the price of strict
//! ordering and is not configurable.
//!
//! Nothing pushed can be cancelled, and there are no timeouts: wrap the
//! transform if you need either.
//!
//! ```rust
//! use futures_limiter::OrderedQueue;
//! use std::time::Duration;
//!
//! tokio_test::block_on(async {
//!     let queue = OrderedQueue::new(5, |n: u64| async move {
//!         // Later items finish first.
//!         tokio::time::sleep(Duration::from_millis(10 - n)).await;
//!         n * 10
//!     });
//!     for n in 0..10 {
//!         queue.push(n);
//!     }
//!
//!     let mut outputs = Vec::new();
//!     while let Some(out) = queue.pop_wait().await {
//!         outputs.push(out);
//!     }
//!     assert_eq!(outputs, (0..10).map(|n| n * 10).collect::<Vec<_>>());
//! });
//! ```
//!
//! Events are emitted through `tracing`; no subscriber is installed.
pub mod builder;
pub mod common;
pub mod errgroup;
pub mod group;
pub mod limiter;
pub mod queue;

pub use crate::builder::Builder;
pub use crate::common::Bounded;
pub use crate::errgroup::ErrGroup;
pub use crate::group::Group;
pub use crate::limiter::{Limiter, Permit};
pub use crate::queue::OrderedQueue;
