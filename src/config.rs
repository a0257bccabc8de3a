use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Per-node configuration, persisted as JSON in the local data directory.
/// Unknown fields are ignored on load so older nodes can read newer files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Shared filesystem mount that all farm nodes rendezvous on.
    pub sync_root: String,

    /// Leader election priority (lower = higher priority).
    pub priority: i32,

    /// HTTP mesh port.
    pub http_port: u16,

    /// IP override (empty = auto-detect).
    pub ip_override: String,

    /// Node tags for job targeting. "leader" biases election for this node,
    /// "noleader" biases against it.
    pub tags: Vec<String>,

    /// Spawn the local render agent on startup.
    pub auto_start_agent: bool,

    /// UDP multicast fast path.
    pub udp_enabled: bool,
    pub udp_port: u16,

    /// Persisted node state: true when the node was stopped at last shutdown.
    pub node_stopped: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sync_root: String::new(),
            priority: 100,
            http_port: 8420,
            ip_override: String::new(),
            tags: Vec::new(),
            auto_start_agent: true,
            udp_enabled: true,
            udp_port: 4243,
            node_stopped: false,
        }
    }
}

impl NodeConfig {
    /// Load config from `path`, falling back to defaults when missing.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_ports() {
        let config = NodeConfig::default();
        assert_eq!(config.http_port, 8420);
        assert_eq!(config.udp_port, 4243);
        assert!(config.udp_enabled);
        assert!(!config.node_stopped);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = NodeConfig::default().with_tag("gpu");
        config.sync_root = "/mnt/farm".into();
        config.node_stopped = true;
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.sync_root, "/mnt/farm");
        assert_eq!(loaded.tags, vec!["gpu".to_string()]);
        assert!(loaded.node_stopped);
    }

    #[test]
    fn load_tolerates_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"http_port": 9000, "future_setting": true}"#).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.http_port, 9000);
    }
}
