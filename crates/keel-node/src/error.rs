//! Node-level errors.

use keel_core::error::{KeelError, StoreError, WindowError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Keel(#[from] KeelError),
    #[error("invalid simulation settings: {0}")]
    Sim(String),
}

impl From<WindowError> for NodeError {
    fn from(e: WindowError) -> Self {
        Self::Keel(e.into())
    }
}

impl From<StoreError> for NodeError {
    fn from(e: StoreError) -> Self {
        Self::Keel(e.into())
    }
}
