use std::path::Path;

use uuid::Uuid;

use crate::error::Result;

/// Load this machine's node id from the data directory, generating and
/// persisting one on first run. Ids are stable across restarts so chunk
/// blacklists and endpoint descriptors keep referring to the same node.
pub fn load_or_generate(data_dir: &Path) -> Result<String> {
    let path = data_dir.join("node_id");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let host = sysinfo::System::host_name().unwrap_or_else(|| "node".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    let id = format!("{}-{}", sanitize(&host), &suffix[..8]);

    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, &id)?;
    tracing::info!(node_id = %id, "generated node identity");
    Ok(id)
}

/// Node ids appear in directory names on the shared filesystem, so restrict
/// them to lowercase alphanumerics and dashes.
fn sanitize(host: &str) -> String {
    let cleaned: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "node".to_string()
    } else {
        trimmed.to_string()
    }
}
