//! Embedded relational persistence for jobs and chunks.
//!
//! The store is the single source of dispatch truth. It is owned exclusively
//! by the current leader: opened (or restored from the shared snapshot) on
//! leadership gain and closed on leadership loss. All operations are atomic;
//! conditional updates (`assign_chunk`, `complete_chunk`) encode the chunk
//! state machine directly in their WHERE clauses, so concurrent callers
//! racing on the same chunk resolve to exactly one winner.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{backup::Backup, params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{FarmError, Result};
use crate::manifest::{ChunkRange, JobManifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Active,
    Paused,
    Cancelled,
    Completed,
    Failed,
    Archived,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Active => "active",
            JobState::Paused => "paused",
            JobState::Cancelled => "cancelled",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(JobState::Active),
            "paused" => Some(JobState::Paused),
            "cancelled" => Some(JobState::Cancelled),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "archived" => Some(JobState::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::Assigned => "assigned",
            ChunkState::Completed => "completed",
            ChunkState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChunkState::Pending),
            "assigned" => Some(ChunkState::Assigned),
            "completed" => Some(ChunkState::Completed),
            "failed" => Some(ChunkState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkState::Completed | ChunkState::Failed)
    }
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRow {
    pub job_id: String,
    pub manifest_json: String,
    pub current_state: JobState,
    pub priority: i32,
    pub submitted_at_ms: i64,
}

impl JobRow {
    pub fn manifest(&self) -> Result<JobManifest> {
        Ok(serde_json::from_str(&self.manifest_json)?)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkRow {
    pub id: i64,
    pub job_id: String,
    pub frame_start: i32,
    pub frame_end: i32,
    pub state: ChunkState,
    pub assigned_to: Option<String>,
    pub assigned_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub retry_count: i32,
    pub completed_frames: Vec<i32>,
    pub failed_on: Vec<String>,
}

impl ChunkRow {
    pub fn range(&self) -> ChunkRange {
        ChunkRange::new(self.frame_start, self.frame_end)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JobProgress {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub rendering: i64,
    pub pending: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job: JobRow,
    pub progress: JobProgress,
}

pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the database at `path` with WAL journaling
    /// and foreign-key enforcement, and apply the idempotent schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        create_schema(&conn)?;

        tracing::info!(path = %path.display(), "database opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Copy `snapshot` to `local` and open the copy. The shared snapshot is
    /// never opened in place. The copy is validated before use; a corrupt
    /// snapshot is an error and the caller decides the fallback.
    pub fn restore_from(snapshot: &Path, local: &Path) -> Result<Self> {
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(snapshot, local)?;

        let store = Self::open(local)?;
        store.integrity_check()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| FarmError::Fatal("store lock poisoned".into()))
    }

    /// Quick structural validation of the database. A snapshot copied over a
    /// network filesystem may be torn; this catches it before the leader
    /// starts dispatching from garbage.
    pub fn integrity_check(&self) -> Result<()> {
        let conn = self.lock()?;
        let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if verdict == "ok" {
            Ok(())
        } else {
            Err(FarmError::Fatal(format!(
                "database failed integrity check: {verdict}"
            )))
        }
    }

    // --- Jobs ---

    pub fn insert_job(&self, job: &JobRow) -> Result<()> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO jobs (job_id, manifest_json, current_state, priority, submitted_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job.job_id,
                job.manifest_json,
                job.current_state.as_str(),
                job.priority,
                job.submitted_at_ms
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(FarmError::AlreadyExists(job.job_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn job(&self, job_id: &str) -> Result<Option<JobRow>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT job_id, manifest_json, current_state, priority, submitted_at_ms
                 FROM jobs WHERE job_id = ?1",
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Every job with a per-state chunk count aggregation, ordered by
    /// dispatch precedence (priority asc, then submission time asc).
    pub fn job_summaries(&self) -> Result<Vec<JobSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT job_id, manifest_json, current_state, priority, submitted_at_ms
             FROM jobs ORDER BY priority ASC, submitted_at_ms ASC",
        )?;
        let jobs: Vec<JobRow> = stmt
            .query_map([], job_from_row)?
            .collect::<rusqlite::Result<_>>()?;

        let mut agg = conn
            .prepare("SELECT state, COUNT(*) FROM chunks WHERE job_id = ?1 GROUP BY state")?;
        let mut summaries = Vec::with_capacity(jobs.len());
        for job in jobs {
            let mut progress = JobProgress::default();
            let rows = agg.query_map(params![job.job_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (state, count) = row?;
                progress.total += count;
                match state.as_str() {
                    "completed" => progress.completed = count,
                    "failed" => progress.failed = count,
                    "assigned" => progress.rendering = count,
                    "pending" => progress.pending = count,
                    _ => {}
                }
            }
            summaries.push(JobSummary { job, progress });
        }
        Ok(summaries)
    }

    pub fn update_job_state(&self, job_id: &str, state: JobState) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET current_state = ?1 WHERE job_id = ?2",
            params![state.as_str(), job_id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_job_priority(&self, job_id: &str, priority: i32) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET priority = ?1 WHERE job_id = ?2",
            params![priority, job_id],
        )?;
        Ok(changed > 0)
    }

    /// Delete a job; its chunks go with it via the cascade.
    pub fn delete_job(&self, job_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
        Ok(changed > 0)
    }

    // --- Chunks ---

    /// Insert all chunk rows for a job in one transaction: all or none.
    pub fn insert_chunks(&self, job_id: &str, ranges: &[ChunkRange]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (job_id, frame_start, frame_end) VALUES (?1, ?2, ?3)",
            )?;
            for range in ranges {
                stmt.execute(params![job_id, range.frame_start, range.frame_end])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn chunks_for_job(&self, job_id: &str) -> Result<Vec<ChunkRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, frame_start, frame_end, state, assigned_to,
                    assigned_at_ms, completed_at_ms, retry_count, completed_frames, failed_on
             FROM chunks WHERE job_id = ?1 ORDER BY frame_start ASC",
        )?;
        let chunks = stmt
            .query_map(params![job_id], chunk_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(chunks)
    }

    // --- Dispatch operations ---

    /// The central dispatch query. Walks active jobs in dispatch precedence
    /// order, skips jobs whose required tags the node lacks, then returns
    /// the first pending chunk (frame order) the node is not blacklisted on,
    /// together with the job's manifest.
    pub fn find_next_pending_for_node(
        &self,
        node_tags: &[String],
        node_id: &str,
    ) -> Result<Option<(ChunkRow, JobManifest)>> {
        let conn = self.lock()?;

        let mut job_stmt = conn.prepare(
            "SELECT j.job_id, j.manifest_json
             FROM jobs j
             WHERE j.current_state = 'active'
               AND EXISTS (SELECT 1 FROM chunks c WHERE c.job_id = j.job_id AND c.state = 'pending')
             ORDER BY j.priority ASC, j.submitted_at_ms ASC",
        )?;
        let jobs: Vec<(String, String)> = job_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let mut chunk_stmt = conn.prepare(
            "SELECT id, job_id, frame_start, frame_end, state, assigned_to,
                    assigned_at_ms, completed_at_ms, retry_count, completed_frames, failed_on
             FROM chunks WHERE job_id = ?1 AND state = 'pending'
             ORDER BY frame_start ASC",
        )?;

        for (job_id, manifest_json) in jobs {
            let manifest: JobManifest = match serde_json::from_str(&manifest_json) {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(job_id = %job_id, error = %err, "skipping job with malformed manifest");
                    continue;
                }
            };

            if !manifest
                .tags_required
                .iter()
                .all(|tag| node_tags.contains(tag))
            {
                continue;
            }

            let chunks = chunk_stmt
                .query_map(params![job_id], chunk_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for chunk in chunks {
                if chunk.failed_on.iter().any(|n| n == node_id) {
                    continue;
                }
                return Ok(Some((chunk, manifest)));
            }
        }
        Ok(None)
    }

    /// Conditional pending → assigned transition. Exactly one of N racing
    /// callers succeeds for a given chunk.
    pub fn assign_chunk(&self, chunk_id: i64, node_id: &str, now_ms: i64) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE chunks SET state = 'assigned', assigned_to = ?1, assigned_at_ms = ?2
             WHERE id = ?3 AND state = 'pending'",
            params![node_id, now_ms, chunk_id],
        )?;
        Ok(changed > 0)
    }

    /// Conditional assigned → completed transition. On success the chunk's
    /// completed frame set snaps to its full range.
    pub fn complete_chunk(
        &self,
        job_id: &str,
        frame_start: i32,
        frame_end: i32,
        now_ms: i64,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE chunks SET state = 'completed', completed_at_ms = ?1
             WHERE job_id = ?2 AND frame_start = ?3 AND frame_end = ?4 AND state = 'assigned'",
            params![now_ms, job_id, frame_start, frame_end],
        )?;
        if changed > 0 {
            let all_frames: Vec<i32> = (frame_start..=frame_end).collect();
            tx.execute(
                "UPDATE chunks SET completed_frames = ?1
                 WHERE job_id = ?2 AND frame_start = ?3 AND frame_end = ?4",
                params![
                    serde_json::to_string(&all_frames)?,
                    job_id,
                    frame_start,
                    frame_end
                ],
            )?;
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Record a work failure: the failing node joins the chunk's blacklist
    /// (idempotently), the retry counter is incremented, and the chunk goes
    /// back to pending while retries remain, terminal failed otherwise.
    pub fn fail_chunk(
        &self,
        job_id: &str,
        frame_start: i32,
        frame_end: i32,
        max_retries: i32,
        failing_node_id: &str,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if !failing_node_id.is_empty() {
            let found = tx
                .query_row(
                    "SELECT id, failed_on FROM chunks
                     WHERE job_id = ?1 AND frame_start = ?2 AND frame_end = ?3 LIMIT 1",
                    params![job_id, frame_start, frame_end],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;

            if let Some((chunk_id, failed_on_json)) = found {
                let mut failed_on: Vec<String> =
                    serde_json::from_str(&failed_on_json).unwrap_or_default();
                if !failed_on.iter().any(|n| n == failing_node_id) {
                    failed_on.push(failing_node_id.to_string());
                    tx.execute(
                        "UPDATE chunks SET failed_on = ?1 WHERE id = ?2",
                        params![serde_json::to_string(&failed_on)?, chunk_id],
                    )?;
                }
            }
        }

        let changed = tx.execute(
            "UPDATE chunks SET
                retry_count = retry_count + 1,
                state = CASE WHEN retry_count + 1 < ?1 THEN 'pending' ELSE 'failed' END,
                assigned_to = CASE WHEN retry_count + 1 < ?1 THEN NULL ELSE assigned_to END,
                assigned_at_ms = CASE WHEN retry_count + 1 < ?1 THEN NULL ELSE assigned_at_ms END
             WHERE job_id = ?2 AND frame_start = ?3 AND frame_end = ?4",
            params![max_retries, job_id, frame_start, frame_end],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Undo an assignment whose dispatch send failed. Unlike `fail_chunk`
    /// this touches neither the retry counter nor the blacklist: the peer
    /// never received the work, so nothing about it has been learned.
    pub fn revert_chunk(&self, job_id: &str, frame_start: i32, frame_end: i32) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE chunks SET state = 'pending', assigned_to = NULL, assigned_at_ms = NULL
             WHERE job_id = ?1 AND frame_start = ?2 AND frame_end = ?3 AND state = 'assigned'",
            params![job_id, frame_start, frame_end],
        )?;
        Ok(changed > 0)
    }

    /// Return every chunk assigned to a dead worker to the pending pool.
    /// A worker crash is not a work failure: retry counts are untouched.
    pub fn reassign_dead_worker(&self, node_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count = conn.execute(
            "UPDATE chunks SET state = 'pending', assigned_to = NULL, assigned_at_ms = NULL
             WHERE assigned_to = ?1 AND state = 'assigned'",
            params![node_id],
        )?;
        if count > 0 {
            tracing::info!(node_id = %node_id, count, "reassigned chunks from dead worker");
        }
        Ok(count)
    }

    pub fn is_job_complete(&self, job_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let open_chunks: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks
             WHERE job_id = ?1 AND state NOT IN ('completed', 'failed')",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(open_chunks == 0)
    }

    /// Record progressively completed frames. Each frame is inserted into
    /// its containing chunk's sorted set; duplicates are ignored. One
    /// transaction per call.
    pub fn add_completed_frames(&self, job_id: &str, frames: &[i32]) -> Result<()> {
        if frames.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "SELECT id, frame_start, frame_end, completed_frames
                 FROM chunks WHERE job_id = ?1 ORDER BY frame_start ASC",
            )?;
            struct Slot {
                id: i64,
                frame_start: i32,
                frame_end: i32,
                frames: Vec<i32>,
                dirty: bool,
            }
            let mut slots: Vec<Slot> = stmt
                .query_map(params![job_id], |row| {
                    let frames_json: String = row.get(3)?;
                    Ok(Slot {
                        id: row.get(0)?,
                        frame_start: row.get(1)?,
                        frame_end: row.get(2)?,
                        frames: serde_json::from_str(&frames_json).unwrap_or_default(),
                        dirty: false,
                    })
                })?
                .collect::<rusqlite::Result<_>>()?;

            for &frame in frames {
                if let Some(slot) = slots
                    .iter_mut()
                    .find(|s| frame >= s.frame_start && frame <= s.frame_end)
                {
                    if !slot.frames.contains(&frame) {
                        slot.frames.push(frame);
                        slot.dirty = true;
                    }
                }
            }

            let mut update = tx.prepare("UPDATE chunks SET completed_frames = ?1 WHERE id = ?2")?;
            for slot in slots.iter_mut().filter(|s| s.dirty) {
                slot.frames.sort_unstable();
                update.execute(params![serde_json::to_string(&slot.frames)?, slot.id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Requeue the entire job: every chunk back to its initial state with
    /// retry counts, blacklists and frame progress cleared.
    pub fn reset_all_chunks(&self, job_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE chunks SET state = 'pending', assigned_to = NULL, assigned_at_ms = NULL,
                    completed_at_ms = NULL, retry_count = 0,
                    completed_frames = '[]', failed_on = '[]'
             WHERE job_id = ?1",
            params![job_id],
        )?;
        Ok(changed > 0)
    }

    /// Give terminally failed chunks a fresh retry budget while preserving
    /// the blacklist, and reactivate the job so dispatch picks them up.
    pub fn retry_failed_chunks(&self, job_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count = conn.execute(
            "UPDATE chunks SET state = 'pending', assigned_to = NULL, assigned_at_ms = NULL,
                    retry_count = 0, completed_frames = '[]'
             WHERE job_id = ?1 AND state = 'failed'",
            params![job_id],
        )?;
        if count > 0 {
            conn.execute(
                "UPDATE jobs SET current_state = 'active' WHERE job_id = ?1",
                params![job_id],
            )?;
            tracing::info!(job_id = %job_id, count, "retrying failed chunks");
        }
        Ok(count)
    }

    // --- Snapshot ---

    /// Online copy of the live database to `dest` using the backup API, so
    /// writers are never blocked for the duration of the copy.
    pub fn snapshot_to(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.lock()?;
        let mut dest_conn = Connection::open(dest)?;
        let backup = Backup::new(&conn, &mut dest_conn)?;
        backup.run_to_completion(256, Duration::from_millis(0), None)?;
        Ok(())
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            manifest_json TEXT NOT NULL,
            current_state TEXT NOT NULL DEFAULT 'active',
            priority INTEGER NOT NULL DEFAULT 50,
            submitted_at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
            frame_start INTEGER NOT NULL,
            frame_end INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            assigned_to TEXT,
            assigned_at_ms INTEGER,
            completed_at_ms INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_job ON chunks(job_id);
        CREATE INDEX IF NOT EXISTS idx_chunks_state ON chunks(state);",
    )?;

    add_column_if_missing(conn, "chunks", "completed_frames TEXT NOT NULL DEFAULT '[]'")?;
    add_column_if_missing(conn, "chunks", "failed_on TEXT NOT NULL DEFAULT '[]'")?;
    Ok(())
}

/// Additive, idempotent column migration.
fn add_column_if_missing(conn: &Connection, table: &str, decl: &str) -> rusqlite::Result<()> {
    match conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {decl}"), []) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(_, Some(ref msg)))
            if msg.contains("duplicate column name") =>
        {
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    let state: String = row.get(2)?;
    Ok(JobRow {
        job_id: row.get(0)?,
        manifest_json: row.get(1)?,
        current_state: JobState::parse(&state).unwrap_or(JobState::Active),
        priority: row.get(3)?,
        submitted_at_ms: row.get(4)?,
    })
}

fn chunk_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
    let state: String = row.get(4)?;
    let completed_frames: String = row.get(9)?;
    let failed_on: String = row.get(10)?;
    Ok(ChunkRow {
        id: row.get(0)?,
        job_id: row.get(1)?,
        frame_start: row.get(2)?,
        frame_end: row.get(3)?,
        state: ChunkState::parse(&state).unwrap_or(ChunkState::Pending),
        assigned_to: row.get(5)?,
        assigned_at_ms: row.get(6)?,
        completed_at_ms: row.get(7)?,
        retry_count: row.get(8)?,
        completed_frames: serde_json::from_str(&completed_frames).unwrap_or_default(),
        failed_on: serde_json::from_str(&failed_on).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_round_trips() {
        for state in [
            JobState::Active,
            JobState::Paused,
            JobState::Cancelled,
            JobState::Completed,
            JobState::Failed,
            JobState::Archived,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("bogus"), None);
    }

    #[test]
    fn chunk_state_round_trips() {
        for state in [
            ChunkState::Pending,
            ChunkState::Assigned,
            ChunkState::Completed,
            ChunkState::Failed,
        ] {
            assert_eq!(ChunkState::parse(state.as_str()), Some(state));
        }
        assert!(ChunkState::Completed.is_terminal());
        assert!(ChunkState::Failed.is_terminal());
        assert!(!ChunkState::Assigned.is_terminal());
    }
}
