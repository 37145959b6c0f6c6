// crates/vmrkl-merkle/src/lib.rs

//! The Reference/State model: an immutable trusted hash tree paired with a
//! mutable per-chunk validity bitmap, and the binary `.mref`/`.mrkl`
//! on-disk footer format both are persisted in.

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

pub mod footer;
pub mod reference;
pub mod state;

pub use reference::Reference;
pub use state::{SaveOutcome, State};
