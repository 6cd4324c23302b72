//! Cache configuration.
//!
//! Controls the response cache via the `[cache]` table of `roundcache.toml`.

use std::num::NonZeroUsize;

use serde::Deserialize;

const DEFAULT_MAX_ENTRIES: usize = 10_000;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable response caching and coalescing.
    pub enabled: bool,
    /// Maximum number of responses held by the in-memory store.
    pub max_entries: usize,
    /// Largest response body that may be stored. Larger bodies are still
    /// shared with concurrent waiters.
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_entries: settings.max_entries.get(),
            max_body_bytes: settings.max_body_bytes,
        }
    }
}

impl CacheConfig {
    /// Returns the entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_entries, 10_000);
        assert_eq!(config.max_body_bytes, 1024 * 1024);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
    }
}
