//! Engine configuration.

use crate::error::{Result, SelectionError};
use crate::history::HistoryConfig;
use crate::index::BackendKind;
use crate::snap::SnapConfig;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of cached point queries.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Spatial index and hit-test cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Requested backend. `Tree` falls back to `Linear` when unavailable.
    pub backend: BackendKind,
    /// Point-query cache entries. Zero disables the cache.
    pub cache_capacity: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Configuration for a selection session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub index: IndexConfig,
    pub snapping: SnapConfig,
    pub history: HistoryConfig,
}

impl EngineConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SelectionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StorageError::Serialization(e.to_string()).into())
    }

    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Reject settings the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        let snap = &self.snapping;
        if !snap.snap_distance.is_finite() || snap.snap_distance < 0.0 {
            return Err(SelectionError::InvalidConfig(format!(
                "snap_distance must be finite and non-negative, got {}",
                snap.snap_distance
            )));
        }
        if !snap.grid_size.is_finite() {
            return Err(SelectionError::InvalidConfig(format!(
                "grid_size must be finite, got {}",
                snap.grid_size
            )));
        }
        if self.history.keep_recent == 0 {
            return Err(SelectionError::InvalidConfig(
                "keep_recent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.index.backend, BackendKind::Tree);
        assert_eq!(config.index.cache_capacity, 1000);
        assert_eq!(config.snapping.snap_distance, 10.0);
        assert_eq!(config.snapping.grid_size, 20.0);
        assert_eq!(config.history.max_history, 50);
        assert_eq!(config.history.keep_recent, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(
            r#"{"index": {"backend": "linear"}, "snapping": {"grid_size": 8.0}}"#,
        )
        .unwrap();
        assert_eq!(config.index.backend, BackendKind::Linear);
        assert_eq!(config.index.cache_capacity, 1000);
        assert_eq!(config.snapping.grid_size, 8.0);
        assert_eq!(config.snapping.snap_distance, 10.0);
        assert_eq!(config.history, HistoryConfig::default());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut config = EngineConfig::default();
        config.history.max_history = 7;
        let back = EngineConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let negative = r#"{"snapping": {"snap_distance": -1.0}}"#;
        assert!(matches!(
            EngineConfig::from_json(negative),
            Err(SelectionError::InvalidConfig(_))
        ));

        let mut config = EngineConfig::default();
        config.history.keep_recent = 0;
        assert!(config.validate().is_err());

        assert!(matches!(
            EngineConfig::from_json("[1, 2]"),
            Err(SelectionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"index": {"cache_capacity": 5}}"#).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().index.cache_capacity, 5);
        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.json")),
            Err(SelectionError::Storage(StorageError::Io(_)))
        ));
    }
}
