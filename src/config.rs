use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::river_network::graph::DEFAULT_NODE_PRECISION;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid network config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("node_precision must be positive and finite, got {0}")]
    Precision(f64),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Grid cells per metre used to snap endpoints onto nodes.
    pub node_precision: f64,
    /// Segments with this watershed code stay out of the graph and are
    /// exported with zero lengths.
    pub excluded_watershed_code: Option<String>,
    pub progress_interval: usize,
    pub tile_workers: usize,
    /// Tiles below this stream order are passed through without merging.
    pub min_merge_stream_order: i32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_precision: DEFAULT_NODE_PRECISION,
            excluded_watershed_code: Some("999".to_string()),
            progress_interval: 100_000,
            tile_workers: 4,
            min_merge_stream_order: 2,
        }
    }
}

impl NetworkConfig {
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: NetworkConfig = ron::from_str(text)?;
        if !(config.node_precision.is_finite() && config.node_precision > 0.0) {
            return Err(ConfigError::Precision(config.node_precision));
        }
        Ok(config)
    }
}
