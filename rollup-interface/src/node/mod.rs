//! The `node` module defines traits which are used by the validator but are not
//! part of the on-chain protocol. Implementations of these traits may be
//! non-deterministic, have access to networking/disk, etc.
pub mod services;
