//! Contains traits for the collaborators a validator talks to.
pub mod chain;
pub mod challenge;
pub mod db;
pub mod execution;
