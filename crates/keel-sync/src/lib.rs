//! # keel-sync — header/block reconstruction window.
//!
//! [`SyncWindow`] accepts headers and bodies from any number of peers, in any
//! order, and turns them into a gap-free sequence of blocks rooted in a
//! trusted ancestor. It also tells the caller which header ranges and which
//! bodies are still missing.

pub mod config;
pub mod request;
pub mod window;

pub use config::WindowConfig;
pub use request::{BlocksRequest, HeadersRequest};
pub use window::{HeaderCandidate, SyncWindow};
