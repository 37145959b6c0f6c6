//! The shared-future plumbing used for per-node fetch deduplication (§4.5,
//! §5, §9 design notes).
//!
//! Multiple readers racing to fetch the same node must await the *same*
//! in-flight task rather than issuing duplicate transport calls.
//! [`futures::future::Shared`] is the natural fit, but its `Output` must be
//! `Clone`; [`ChannelError`](crate::error::ChannelError) carries a boxed
//! `dyn Error` and isn't, so the shared outcome is `Arc`-wrapped instead.

use std::sync::Arc;

use futures::future::{BoxFuture, Shared};

use crate::error::ChannelError;

/// The outcome type every waiter on a node's fetch future observes.
pub type SharedFetchOutcome = Result<(), Arc<ChannelError>>;

/// A future, shared across every caller waiting on the same node's fetch,
/// resolving once that node's chunks have been fetched and verified (or
/// failed).
pub type SharedChunkFuture = Shared<BoxFuture<'static, SharedFetchOutcome>>;
