// crates/vmrkl-core/src/lib.rs

//! Core types for the verified, resumable, range-fetching file channel.
//!
//! This crate holds the pieces with no I/O or concurrency concerns of
//! their own: tree [`shape`] geometry, the workspace-wide [`error`]
//! taxonomy, SHA-256 [`hash`] primitives, and the abstract [`transport`]
//! contract that higher layers fetch bytes through.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]

pub mod error;
pub mod future;
pub mod hash;
pub mod shape;
pub mod transport;

pub use error::{ByteRange, ChannelError, ChannelResult, CoreError, CoreResult};
pub use future::{SharedChunkFuture, SharedFetchOutcome};
pub use hash::{hash_internal, hash_leaf, virtual_leaf_sentinel, Digest32};
pub use shape::Shape;
pub use transport::{Transport, TransportError, TransportFactory, TransportRegistry};
