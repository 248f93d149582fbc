//! TOML-based configuration for the relay node.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(String),
}

/// Top-level node configuration loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub storage: StorageSection,
    /// Optional path to the BPSec policy document.
    pub security_config: Option<PathBuf>,
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("failed to read config file: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(format!("failed to parse config: {e}")))
    }
}

/// The `[node]` section.
#[derive(Debug, Deserialize)]
pub struct NodeSection {
    /// This node's ipn node number.
    #[serde(default = "default_node_id")]
    pub node_id: u64,
    /// Service number used when this node acts as a security source.
    #[serde(default = "default_service_id")]
    pub service_id: u64,
}

fn default_node_id() -> u64 {
    1
}

fn default_service_id() -> u64 {
    0
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            service_id: default_service_id(),
        }
    }
}

/// The `[storage]` section.
#[derive(Debug, Deserialize)]
pub struct StorageSection {
    /// One store file per disk.
    #[serde(default)]
    pub store_file_paths: Vec<PathBuf>,
    #[serde(default = "default_capacity")]
    pub total_capacity_bytes: u64,
    #[serde(default = "default_restore")]
    pub try_restore_from_disk: bool,
    #[serde(default)]
    pub auto_delete_files_on_exit: bool,
}

fn default_capacity() -> u64 {
    // one million segments
    1_000_000 * 4096
}

fn default_restore() -> bool {
    true
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            store_file_paths: Vec::new(),
            total_capacity_bytes: default_capacity(),
            try_restore_from_disk: default_restore(),
            auto_delete_files_on_exit: false,
        }
    }
}

impl StorageSection {
    /// Convert into store construction options.
    pub fn to_store_options(&self) -> bpn_storage::StoreOptions {
        let mut options = bpn_storage::StoreOptions::new(
            self.store_file_paths.clone(),
            self.total_capacity_bytes,
        );
        options.try_restore_from_disk = self.try_restore_from_disk;
        options.auto_delete_files_on_exit = self.auto_delete_files_on_exit;
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = NodeConfig::parse(
            r#"
[node]
node_id = 10
service_id = 2

[storage]
store_file_paths = ["/mnt/sda1/store0.bin", "/mnt/sdb1/store1.bin"]
total_capacity_bytes = 8192000
try_restore_from_disk = false
auto_delete_files_on_exit = true

security_config = "bpsec.toml"
"#,
        )
        .unwrap();
        assert_eq!(config.node.node_id, 10);
        assert_eq!(config.node.service_id, 2);
        assert_eq!(config.storage.store_file_paths.len(), 2);
        assert!(!config.storage.try_restore_from_disk);
        assert!(config.storage.auto_delete_files_on_exit);
        assert_eq!(config.security_config.unwrap(), PathBuf::from("bpsec.toml"));

        let options = config.storage.to_store_options();
        assert_eq!(options.total_capacity_bytes, 8_192_000);
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::parse("").unwrap();
        assert_eq!(config.node.node_id, 1);
        assert!(config.storage.try_restore_from_disk);
        assert!(config.security_config.is_none());
    }

    #[test]
    fn test_malformed_config() {
        assert!(NodeConfig::parse("[node\nnode_id = 1").is_err());
    }
}
