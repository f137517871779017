use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub chunk: ChunkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// memory:// or local://path/to/dir
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// How long a queued out-of-order append waits for its gap to close
    /// before it resolves with a timeout.
    #[serde(default = "default_pending_append_timeout_ms")]
    pub pending_append_timeout_ms: u64,
}

impl ChunkConfig {
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_append_timeout_ms)
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            pending_append_timeout_ms: default_pending_append_timeout_ms(),
        }
    }
}

fn default_pending_append_timeout_ms() -> u64 {
    crate::chunk::DEFAULT_PENDING_APPEND_TIMEOUT.as_millis() as u64
}

impl Config {
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("FLINTIO"))
            .build()
            .map_err(|e| crate::error::FlintError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| crate::error::FlintError::Config(e.to_string()))?;

        Ok(config)
    }
}
