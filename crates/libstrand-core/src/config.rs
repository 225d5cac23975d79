use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StrandError;
use crate::types::remote::{ChannelConfig, RemoteFilter};

/// Default file name looked up by the daemon
pub const CONFIG_FILE_NAME: &str = "strand.toml";

/// Node configuration stored in strand.toml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrandConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub reactor: ReactorConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Remotes registered at startup when absent from storage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remotes: Vec<RemoteConfig>,
}

/// Listener update loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Debounce window of triggered updates
    pub update_delay_ms: u64,
    /// Process listeners one by one instead of concurrently
    pub sequential_updates: bool,
    /// Continuation passes allowed before giving up
    pub max_continues: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            update_delay_ms: 250,
            sequential_updates: false,
            max_continues: 500,
        }
    }
}

impl ListenerConfig {
    pub fn update_delay(&self) -> Duration {
        Duration::from_millis(self.update_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    pub max_retries: u32,
    /// Bound for waits on read-model consistency
    pub read_model_timeout_ms: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            read_model_timeout_ms: 5000,
        }
    }
}

/// Channel and mailbox settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub outbox_flush_ms: u64,
    pub outbox_max_queued: usize,
    pub cursor_write_delay_ms: u64,
    pub max_failures: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            outbox_flush_ms: 500,
            outbox_max_queued: 25,
            cursor_write_delay_ms: 100,
            max_failures: 5,
            retry_base_ms: 1000,
            retry_max_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled directory; in-memory storage when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub name: String,
    pub collection_id: String,
    pub channel: ChannelConfig,
    #[serde(default)]
    pub filter: RemoteFilter,
}

/// Load config from a TOML file; `Ok(None)` when the file does not exist
pub fn load_config(path: &Path) -> Result<Option<StrandConfig>, StrandError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let config: StrandConfig = toml::from_str(&content)?;
    Ok(Some(config))
}

/// Save config to a TOML file, creating parent directories
pub fn save_config(path: &Path, config: &StrandConfig) -> Result<(), StrandError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
