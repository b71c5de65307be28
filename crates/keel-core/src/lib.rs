//! # keel-core
//! Foundation types, errors and collaborator traits shared by the Keel
//! synchronization crates.

pub mod chain;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod memory;
pub mod traits;
pub mod types;
