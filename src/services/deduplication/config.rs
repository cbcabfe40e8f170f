//! Deduplication configuration.

/// Default number of neighbors compared per candidate.
pub const DEFAULT_NEIGHBORS: usize = 3;

/// Configuration for the deduplication engine.
///
/// Set from `DormsoupConfig` (`[dedup]` section and `DORMSOUP_DEDUP_*`).
///
/// # Example
///
/// ```rust
/// use dormsoup::services::deduplication::DeduplicationConfig;
///
/// let config = DeduplicationConfig::default().with_neighbors(5);
/// assert!(config.enabled);
/// assert_eq!(config.neighbors, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeduplicationConfig {
    /// When false every candidate is inserted as a new event.
    pub enabled: bool,

    /// Number of nearest titles examined per candidate (the `k` of KNN).
    pub neighbors: usize,
}

impl DeduplicationConfig {
    /// Builder method to set enabled state.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Builder method to set the neighbor count.
    #[must_use]
    pub const fn with_neighbors(mut self, neighbors: usize) -> Self {
        self.neighbors = neighbors;
        self
    }
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            neighbors: DEFAULT_NEIGHBORS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeduplicationConfig::default();
        assert!(config.enabled);
        assert_eq!(config.neighbors, 3);
    }

    #[test]
    fn test_builders() {
        let config = DeduplicationConfig::default()
            .with_enabled(false)
            .with_neighbors(1);
        assert!(!config.enabled);
        assert_eq!(config.neighbors, 1);
    }
}
