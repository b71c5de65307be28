//! Cross-crate test suite for the Keel sync engine.
//!
//! Property tests for the sync window, the scenario checks for window,
//! validation, pool and connection behaviour, and end-to-end sync runs
//! against simulated peers.

pub mod helpers;
