#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod chain;
mod execution;
mod handlers;

pub use chain::*;
pub use execution::*;
pub use handlers::*;
