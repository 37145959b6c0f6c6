// crates/vmrkl-channel/src/lib.rs

//! The verified, resumable, range-fetching async file channel (§4.6).
//!
//! This crate wires the [`vmrkl_merkle`] Reference/State model and the
//! [`vmrkl_scheduler`] strategy family together with a concrete
//! [`cache_file`] and a set of [`transport`] providers, behind the public
//! [`channel::VerifiedFileChannel`] read/prebuffer/force/close surface.
//! The [`dispatcher`] is the concurrency core: it dedupes in-flight node
//! fetches and drives each through fetch, hash-verify, and persist.

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

pub mod cache_file;
pub mod channel;
pub mod dispatcher;
pub mod retry;
pub mod transport;

pub use cache_file::CacheFile;
pub use channel::{ChannelConfig, VerifiedFileChannel};
pub use dispatcher::Dispatcher;
pub use retry::RetryConfig;
