use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{FarmError, Result};

/// Bumped when the on-disk farm layout or wire protocol changes
/// incompatibly; nodes on different protocol versions use disjoint farm
/// directories and never see each other.
pub const PROTOCOL_VERSION: u32 = 2;

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Paths inside the shared farm directory `<sync_root>/MidRender-v<N>/`.
#[derive(Debug, Clone)]
pub struct FarmPaths {
    root: PathBuf,
}

impl FarmPaths {
    pub fn new(sync_root: &Path) -> Self {
        Self {
            root: sync_root.join(format!("MidRender-v{PROTOCOL_VERSION}")),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn farm_json(&self) -> PathBuf {
        self.root.join("farm.json")
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join("nodes")
    }

    pub fn node_dir(&self, node_id: &str) -> PathBuf {
        self.nodes_dir().join(node_id)
    }

    pub fn endpoint_file(&self, node_id: &str) -> PathBuf {
        self.node_dir(node_id).join("endpoint.json")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn snapshot_file(&self) -> PathBuf {
        self.state_dir().join("snapshot.db")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(job_id)
    }
}

/// Create the farm directory skeleton and write `farm.json` on first run.
/// The sync root itself must already exist; a missing mount is fatal.
pub fn ensure_layout(paths: &FarmPaths, node_id: &str) -> Result<()> {
    let sync_root = paths
        .root()
        .parent()
        .ok_or_else(|| FarmError::Fatal("sync root has no parent".into()))?;
    if !sync_root.is_dir() {
        return Err(FarmError::Fatal(format!(
            "sync root does not exist: {}",
            sync_root.display()
        )));
    }

    std::fs::create_dir_all(paths.nodes_dir())?;
    std::fs::create_dir_all(paths.state_dir())?;
    std::fs::create_dir_all(paths.jobs_dir())?;

    let farm_json = paths.farm_json();
    if !farm_json.exists() {
        tracing::info!(path = %farm_json.display(), "creating farm.json");
        let body = serde_json::json!({
            "_version": 1,
            "protocol_version": PROTOCOL_VERSION,
            "created_by": node_id,
            "created_at_ms": chrono::Utc::now().timestamp_millis(),
        });
        write_json_atomic(&farm_json, &body)?;
    }

    Ok(())
}

/// Write JSON via temp-file-then-rename so concurrent readers on the shared
/// filesystem never observe a truncated file. Falls back to a direct write
/// when the rename fails (some network filesystems reject it).
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let body = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &body)?;

    if let Err(err) = std::fs::rename(&tmp, path) {
        tracing::debug!(path = %path.display(), error = %err, "rename failed, writing directly");
        std::fs::write(path, &body)?;
        let _ = std::fs::remove_file(&tmp);
    }
    Ok(())
}
