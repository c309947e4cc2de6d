//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the dependency engine.
///
/// The ceilings bound how much deferred work may accumulate before creators
/// are paused and the background cleaner is asked to retire some of it. The
/// pause is always bounded so a stalled cleaner cannot wedge creators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftdepConfig {
    /// Maximum outstanding inode dependencies before creators are paused.
    /// Default: 4096.
    pub max_inode_deps: usize,
    /// Maximum outstanding removal dependencies before creators are paused.
    /// Limiting removals also bounds the freefile/freeblks populations they
    /// feed. Default: 2048.
    pub max_removal_deps: usize,
    /// Upper bound on how long a creator waits for the cleaner before
    /// proceeding anyway. Default: 100ms.
    pub cleanup_pause: Duration,
    /// Initial bucket count for each dependency index (power of two).
    /// Default: 64.
    pub index_buckets: usize,
    /// How many drain rounds a full flush attempts before reporting the
    /// remaining dependency count. Default: 64.
    pub flush_retry_limit: usize,
}

impl Default for SoftdepConfig {
    fn default() -> Self {
        Self {
            max_inode_deps: 4096,
            max_removal_deps: 2048,
            cleanup_pause: Duration::from_millis(100),
            index_buckets: 64,
            flush_retry_limit: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SoftdepConfig::default();
        assert!(config.max_inode_deps > config.max_removal_deps);
        assert!(config.index_buckets.is_power_of_two());
        assert!(config.cleanup_pause > Duration::ZERO);
    }

    #[test]
    fn overrides_stick() {
        let config = SoftdepConfig {
            max_inode_deps: 8,
            cleanup_pause: Duration::from_millis(5),
            ..SoftdepConfig::default()
        };
        assert_eq!(config.max_inode_deps, 8);
        assert_eq!(config.cleanup_pause, Duration::from_millis(5));
        assert_eq!(config.max_removal_deps, SoftdepConfig::default().max_removal_deps);
    }
}
