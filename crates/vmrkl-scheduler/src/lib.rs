// crates/vmrkl-scheduler/src/lib.rs

//! The chunk scheduler family: pluggable strategies that, given a read
//! request and the current validity bitmap, decide which tree nodes
//! (leaves or consolidated internal nodes) to fetch.

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

mod adaptive;
mod aggressive;
mod conservative;
mod default_strategy;
mod select;
mod strategy;
mod task;

pub use adaptive::Adaptive;
pub use aggressive::Aggressive;
pub use conservative::Conservative;
pub use default_strategy::DefaultStrategy;
pub use select::StrategyParams;
pub use strategy::Strategy;
pub use task::{NodeDownloadTask, SchedulingTarget};
