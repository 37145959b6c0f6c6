// crates/vmrkl-build/src/lib.rs

//! Parallel hashing of a source file into a fresh [`vmrkl_merkle::Reference`]
//! (§4.7). Hashes chunks across a `rayon` thread pool and publishes a
//! [`BuildProgress`] snapshot after each, leaving rendering (a log line, a
//! spinner) to the caller.

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
pub mod pipeline;
pub mod progress;

pub use error::{BuildError, BuildResult};
pub use pipeline::{build_and_save, build_reference, build_reference_blocking};
pub use progress::BuildProgress;
