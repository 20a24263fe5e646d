//! This crate defines the core types and traits shared by BoLD validators.
//! It specifies the assertion data model observed on the parent chain, and the
//! narrow interfaces through which a validator talks to the chain, to its local
//! execution engine, to the challenge manager and to an optional database.

#![deny(missing_docs)]

mod state_machine;
pub use state_machine::*;

mod node;

pub use ethereum_types::{Address, H256, U256};
pub use node::*;
