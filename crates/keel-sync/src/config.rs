//! Sync window configuration.

use keel_core::constants::{DEFAULT_WINDOW_SIZE, FAR_AHEAD_FACTOR};

/// Configuration for a [`SyncWindow`](crate::SyncWindow).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowConfig {
    /// Generations kept above the settled ancestor. Also the size of a
    /// gap-closing header request and the minimum seed chain length.
    pub window_size: usize,
    /// Headers more than `window_size * far_ahead_factor` above the highest
    /// known number are dropped.
    pub far_ahead_factor: u64,
    /// Seed for the direction of gap-closing requests. `None` seeds from
    /// the OS.
    pub rng_seed: Option<u64>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            far_ahead_factor: FAR_AHEAD_FACTOR,
            rng_seed: None,
        }
    }
}

impl WindowConfig {
    /// Default configuration with a different window size.
    pub fn with_window_size(window_size: usize) -> Self {
        Self {
            window_size,
            ..Self::default()
        }
    }

    /// Highest acceptable header number given the current highest known number.
    pub fn horizon(&self, max_num: u64) -> u64 {
        max_num.saturating_add((self.window_size as u64).saturating_mul(self.far_ahead_factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_window_is_192() {
        let cfg = WindowConfig::default();
        assert_eq!(cfg.window_size, 192);
        assert_eq!(cfg.far_ahead_factor, 128);
        assert!(cfg.rng_seed.is_none());
    }

    #[test]
    fn horizon_scales_with_window() {
        let cfg = WindowConfig::with_window_size(10);
        assert_eq!(cfg.horizon(100), 100 + 10 * 128);
        assert_eq!(cfg.horizon(u64::MAX), u64::MAX);
    }
}
