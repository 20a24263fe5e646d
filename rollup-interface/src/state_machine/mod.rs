//! Defines the types describing assertions and the execution states they claim.
//! Items in this module are plain data: they are read from the parent chain and
//! never mutated locally.
pub mod assertion;
pub mod mode;

pub use assertion::*;
pub use mode::Mode;
