use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CollectorError, CollectorResult};

/// Credentials and endpoints for the Graph tenant being mirrored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_authority")]
    pub authority: String,
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String
}

/// Collection tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub graph: GraphConfig,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Cap on the number of service principals traversed, for bounded
    /// verification runs.
    #[serde(default)]
    pub debug_count: Option<usize>,
    #[serde(default = "default_retry_config")]
    pub retry: RetryConfig
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32
}

fn default_authority() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_batch_size() -> usize {
    250
}

fn default_concurrency() -> usize {
    5
}

fn default_batch_delay_ms() -> u64 {
    500
}

fn default_retry_config() -> RetryConfig {
    RetryConfig { max_retries: 3 }
}

impl Default for RetryConfig {
    fn default() -> Self {
        default_retry_config()
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            authority: default_authority(),
            graph_base_url: default_graph_base_url()
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            graph: GraphConfig::default(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            batch_delay_ms: default_batch_delay_ms(),
            debug_count: None,
            retry: default_retry_config()
        }
    }
}

impl CollectorConfig {
    /// Loads a YAML config file.
    pub fn from_file(path: impl AsRef<Path>) -> CollectorResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CollectorError::ConfigError(format!(
                "could not read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            CollectorError::ConfigError(format!(
                "invalid yaml configuration {}: {e}",
                path.as_ref().display()
            ))
        })
    }
}
