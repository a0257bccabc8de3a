use serde::{Deserialize, Serialize};

/// Immutable description of a submitted render job. The `command` descriptor
/// is opaque to the farm core; only the render agent interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    pub job_id: String,
    pub template_id: String,
    pub submitted_by: String,
    pub submitted_at_ms: i64,
    pub frame_start: i32,
    pub frame_end: i32,
    pub chunk_size: i32,
    pub max_retries: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub tags_required: Vec<String>,
    #[serde(default)]
    pub command: serde_json::Value,
}

impl JobManifest {
    /// Basic structural validation applied at every submission boundary.
    pub fn validate(&self) -> Result<(), String> {
        if self.job_id.is_empty() {
            return Err("job_id must not be empty".into());
        }
        if self.frame_start > self.frame_end {
            return Err(format!(
                "frame range is inverted: {}..{}",
                self.frame_start, self.frame_end
            ));
        }
        if self.chunk_size < 1 {
            return Err(format!("chunk_size must be >= 1, got {}", self.chunk_size));
        }
        if self.max_retries < 1 {
            return Err(format!("max_retries must be >= 1, got {}", self.max_retries));
        }
        Ok(())
    }
}

/// Inclusive frame sub-range, the unit of dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub frame_start: i32,
    pub frame_end: i32,
}

impl ChunkRange {
    pub fn new(frame_start: i32, frame_end: i32) -> Self {
        Self {
            frame_start,
            frame_end,
        }
    }

    /// Short human label: "f42" for a single frame, "f42-50" otherwise.
    pub fn label(&self) -> String {
        if self.frame_start == self.frame_end {
            format!("f{}", self.frame_start)
        } else {
            format!("f{}-{}", self.frame_start, self.frame_end)
        }
    }

    pub fn contains(&self, frame: i32) -> bool {
        frame >= self.frame_start && frame <= self.frame_end
    }

    pub fn frames(&self) -> impl Iterator<Item = i32> {
        self.frame_start..=self.frame_end
    }
}

impl std::fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Split `[frame_start, frame_end]` into consecutive ranges of `chunk_size`
/// frames; the final range may be shorter. The ranges partition the job's
/// frame range with no gaps and no overlap.
pub fn split_frames(frame_start: i32, frame_end: i32, chunk_size: i32) -> Vec<ChunkRange> {
    let step = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = frame_start;
    while start <= frame_end {
        let end = (start + step - 1).min(frame_end);
        chunks.push(ChunkRange::new(start, end));
        start = end + 1;
    }
    chunks
}
