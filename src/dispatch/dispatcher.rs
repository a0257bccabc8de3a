//! The leader-only dispatch loop.
//!
//! One tick every 2 s drains the inbound queues, reaps dead workers,
//! detects finished jobs, offers work to eligible idle peers, and writes a
//! periodic snapshot to the shared filesystem. The tick order is fixed so a
//! chunk reported failed can never be re-assigned within the same tick.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::failure_tracker::FailureTracker;
use super::queues::{DispatchQueues, SubmitRequest};
use crate::error::{FarmError, Result};
use crate::farmfs::FarmPaths;
use crate::manifest::{split_frames, JobManifest};
use crate::peers::{NodeState, PeerInfo, PeerRegistry, RenderState};
use crate::render::{RenderQueue, RenderTask};
use crate::store::{JobRow, JobState, Store};

pub const DISPATCH_INTERVAL: Duration = Duration::from_secs(2);
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

const ASSIGN_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const ASSIGN_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Fallback retry budget when a failure report references a job whose
/// manifest cannot be read.
const DEFAULT_MAX_RETRIES: i32 = 3;

/// The leader's store handle. `None` while this node is a follower or while
/// a role transition is still restoring the snapshot.
pub type SharedStore = Arc<RwLock<Option<Store>>>;

pub struct Dispatcher {
    registry: Arc<PeerRegistry>,
    queues: Arc<DispatchQueues>,
    failures: Arc<FailureTracker>,
    store: SharedStore,
    render: RenderQueue,
    paths: FarmPaths,
    /// Local directory for snapshot scratch files, kept off the network FS.
    scratch_dir: PathBuf,
    http: reqwest::Client,
    last_snapshot: Instant,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<PeerRegistry>,
        queues: Arc<DispatchQueues>,
        failures: Arc<FailureTracker>,
        store: SharedStore,
        render: RenderQueue,
        paths: FarmPaths,
        scratch_dir: PathBuf,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(ASSIGN_CONNECT_TIMEOUT)
            .timeout(ASSIGN_READ_TIMEOUT)
            .build()?;
        Ok(Self {
            registry,
            queues,
            failures,
            store,
            render,
            paths,
            scratch_dir,
            http,
            last_snapshot: Instant::now(),
        })
    }

    /// Drive ticks while this node is leader with its database ready.
    pub async fn run(mut self, leader_ready: Arc<AtomicBool>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(DISPATCH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.registry.is_local_leader() && leader_ready.load(Ordering::SeqCst) {
                self.tick().await;
            }
        }
        tracing::info!("dispatcher stopped");
    }

    pub async fn tick(&mut self) {
        let guard = self.store.read().await;
        let Some(store) = guard.as_ref() else {
            return;
        };

        self.process_submissions(store);
        self.process_completions(store);
        self.process_failures(store);
        self.process_frames(store);
        self.reap_dead_workers(store);
        self.check_job_completions(store);
        self.assign_work(store).await;

        if self.last_snapshot.elapsed() >= SNAPSHOT_INTERVAL {
            self.write_snapshot(store);
            self.last_snapshot = Instant::now();
        }
    }

    fn process_submissions(&self, store: &Store) {
        for SubmitRequest { manifest, priority } in self.queues.drain_submissions() {
            if let Err(err) = submit_job(store, &manifest, priority) {
                tracing::error!(job_id = %manifest.job_id, error = %err, "job submission failed");
            }
        }
    }

    fn process_completions(&self, store: &Store) {
        for report in self.queues.drain_completions() {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let chunk_label = format!("f{}-{}", report.frame_start, report.frame_end);
            match store.complete_chunk(&report.job_id, report.frame_start, report.frame_end, now_ms)
            {
                Ok(true) => {
                    tracing::info!(
                        job_id = %report.job_id,
                        chunk = %chunk_label,
                        node_id = %report.node_id,
                        elapsed_ms = report.elapsed_ms,
                        "chunk completed"
                    );
                }
                Ok(false) => {
                    tracing::debug!(job_id = %report.job_id, "completion for chunk not in assigned state");
                }
                Err(err) => {
                    tracing::error!(job_id = %report.job_id, error = %err, "complete_chunk failed");
                }
            }
        }
    }

    fn process_failures(&self, store: &Store) {
        for report in self.queues.drain_failures() {
            let max_retries = store
                .job(&report.job_id)
                .ok()
                .flatten()
                .and_then(|row| row.manifest().ok())
                .map(|m| m.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES);

            if let Err(err) = store.fail_chunk(
                &report.job_id,
                report.frame_start,
                report.frame_end,
                max_retries,
                &report.node_id,
            ) {
                tracing::error!(job_id = %report.job_id, error = %err, "fail_chunk failed");
            }

            let chunk_label = format!("f{}-{}", report.frame_start, report.frame_end);
            tracing::warn!(
                job_id = %report.job_id,
                chunk = %chunk_label,
                node_id = %report.node_id,
                error = %report.error,
                "chunk failed"
            );

            if !report.node_id.is_empty() {
                let now_ms = chrono::Utc::now().timestamp_millis();
                if self.failures.record_failure(&report.node_id, now_ms) {
                    tracing::warn!(
                        node_id = %report.node_id,
                        "node suspended after repeated failures"
                    );
                }
            }
        }
    }

    fn process_frames(&self, store: &Store) {
        let reports = self.queues.drain_frames();
        if reports.is_empty() {
            return;
        }
        let mut by_job: std::collections::HashMap<String, Vec<i32>> = Default::default();
        for report in reports {
            by_job.entry(report.job_id).or_default().push(report.frame);
        }
        for (job_id, frames) in by_job {
            if let Err(err) = store.add_completed_frames(&job_id, &frames) {
                tracing::error!(job_id = %job_id, error = %err, "frame report batch failed");
            }
        }
    }

    fn reap_dead_workers(&self, store: &Store) {
        for peer in self.registry.snapshot() {
            if !peer.is_alive {
                if let Err(err) = store.reassign_dead_worker(&peer.node_id) {
                    tracing::error!(node_id = %peer.node_id, error = %err, "dead worker reassignment failed");
                }
            }
        }
    }

    fn check_job_completions(&self, store: &Store) {
        let summaries = match store.job_summaries() {
            Ok(summaries) => summaries,
            Err(err) => {
                tracing::error!(error = %err, "job summary query failed");
                return;
            }
        };
        for summary in summaries {
            if summary.job.current_state != JobState::Active {
                continue;
            }
            match store.is_job_complete(&summary.job.job_id) {
                Ok(true) => {
                    if let Err(err) =
                        store.update_job_state(&summary.job.job_id, JobState::Completed)
                    {
                        tracing::error!(job_id = %summary.job.job_id, error = %err, "completion transition failed");
                    } else {
                        tracing::info!(job_id = %summary.job.job_id, "job completed");
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(job_id = %summary.job.job_id, error = %err, "completion check failed");
                }
            }
        }
    }

    /// Offer at most one chunk to every eligible idle node (alive, not
    /// stopped, not rendering, not suspended), local node included.
    async fn assign_work(&self, store: &Store) {
        let mut candidates: Vec<PeerInfo> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|p| p.is_alive)
            .collect();
        candidates.push(self.registry.local_peer_info());

        for peer in candidates {
            if peer.node_state == NodeState::Stopped
                || peer.render_state == RenderState::Rendering
                || self.failures.is_suspended(&peer.node_id)
            {
                continue;
            }

            let next = match store.find_next_pending_for_node(&peer.tags, &peer.node_id) {
                Ok(next) => next,
                Err(err) => {
                    tracing::error!(error = %err, "dispatch query failed");
                    return;
                }
            };
            let Some((chunk, manifest)) = next else {
                // No compatible work for this peer; others may still match.
                continue;
            };

            let now_ms = chrono::Utc::now().timestamp_millis();
            match store.assign_chunk(chunk.id, &peer.node_id, now_ms) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::error!(error = %err, "assign_chunk failed");
                    continue;
                }
            }

            let delivered = if peer.is_local {
                self.render
                    .dispatch(RenderTask {
                        manifest: manifest.clone(),
                        chunk: chunk.range(),
                    })
                    .map_err(|err| err.to_string())
            } else {
                self.post_assignment(&peer, &manifest, &chunk).await
            };

            match delivered {
                Ok(()) => {
                    tracing::info!(
                        node_id = %peer.node_id,
                        job_id = %chunk.job_id,
                        chunk = %chunk.range(),
                        local = peer.is_local,
                        "chunk assigned"
                    );
                }
                Err(reason) => {
                    tracing::warn!(
                        node_id = %peer.node_id,
                        job_id = %chunk.job_id,
                        chunk = %chunk.range(),
                        reason = %reason,
                        "dispatch send failed, reverting chunk"
                    );
                    if let Err(err) =
                        store.revert_chunk(&chunk.job_id, chunk.frame_start, chunk.frame_end)
                    {
                        tracing::error!(error = %err, "chunk revert failed");
                    }
                }
            }
        }
    }

    async fn post_assignment(
        &self,
        peer: &PeerInfo,
        manifest: &JobManifest,
        chunk: &crate::store::ChunkRow,
    ) -> std::result::Result<(), String> {
        let url = format!("http://{}/api/dispatch/assign", peer.endpoint);
        let body = serde_json::json!({
            "manifest": manifest,
            "frame_start": chunk.frame_start,
            "frame_end": chunk.frame_end,
        });
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("status {}", resp.status())),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Snapshot to a local scratch file first (fast), then move the file to
    /// the shared filesystem on a background task so the network copy never
    /// stalls the dispatch cadence.
    fn write_snapshot(&self, store: &Store) {
        let scratch = self.scratch_dir.join(format!(
            "snapshot_{}.tmp",
            chrono::Utc::now().timestamp_millis()
        ));
        if let Err(err) = store.snapshot_to(&scratch) {
            tracing::warn!(error = %err, "snapshot failed");
            return;
        }

        let dest = self.paths.snapshot_file();
        tokio::task::spawn_blocking(move || {
            // Stage next to the destination, then rename: atomic within the
            // destination filesystem, so readers never see a torn snapshot.
            let staged = dest.with_extension("db.tmp");
            let moved = std::fs::copy(&scratch, &staged)
                .and_then(|_| std::fs::rename(&staged, &dest));
            let _ = std::fs::remove_file(&scratch);
            match moved {
                Ok(()) => tracing::info!("snapshot written"),
                Err(err) => tracing::warn!(error = %err, "snapshot move failed"),
            }
        });
    }
}

/// Persist one job row plus its chunk partition. All-or-nothing: if the
/// chunks cannot be written the job row is removed again.
pub fn submit_job(store: &Store, manifest: &JobManifest, priority: i32) -> Result<String> {
    manifest.validate().map_err(FarmError::Validation)?;

    let row = JobRow {
        job_id: manifest.job_id.clone(),
        manifest_json: serde_json::to_string(manifest)?,
        current_state: JobState::Active,
        priority,
        submitted_at_ms: manifest.submitted_at_ms,
    };
    store.insert_job(&row)?;

    let chunks = split_frames(manifest.frame_start, manifest.frame_end, manifest.chunk_size);
    if let Err(err) = store.insert_chunks(&manifest.job_id, &chunks) {
        let _ = store.delete_job(&manifest.job_id);
        return Err(err);
    }

    tracing::info!(job_id = %manifest.job_id, chunks = chunks.len(), "job submitted");
    Ok(manifest.job_id.clone())
}

/// Copy an existing job's manifest into a brand new job: fresh chunks, zero
/// retry counts, empty blacklists. The new id strips any trailing `-v<N>`
/// and appends the next unused version suffix.
pub fn resubmit_job(store: &Store, source_job_id: &str) -> Result<String> {
    let row = store
        .job(source_job_id)?
        .ok_or_else(|| FarmError::JobNotFound(source_job_id.to_string()))?;
    let mut manifest = row.manifest()?;

    let base = strip_version_suffix(&manifest.job_id).to_string();
    let mut new_id = None;
    for suffix in 2..1000 {
        let candidate = format!("{base}-v{suffix}");
        if store.job(&candidate)?.is_none() {
            new_id = Some(candidate);
            break;
        }
    }
    let new_id =
        new_id.ok_or_else(|| FarmError::Validation("no free version suffix".to_string()))?;

    manifest.job_id = new_id;
    manifest.submitted_at_ms = chrono::Utc::now().timestamp_millis();
    submit_job(store, &manifest, row.priority)
}

fn strip_version_suffix(slug: &str) -> &str {
    if let Some(pos) = slug.rfind("-v") {
        let digits = &slug[pos + 2..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return &slug[..pos];
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_suffix_stripping() {
        assert_eq!(strip_version_suffix("shot-010"), "shot-010");
        assert_eq!(strip_version_suffix("shot-010-v2"), "shot-010");
        assert_eq!(strip_version_suffix("shot-010-v13"), "shot-010");
        assert_eq!(strip_version_suffix("shot-v"), "shot-v");
        assert_eq!(strip_version_suffix("shot-via"), "shot-via");
        assert_eq!(strip_version_suffix("-v3"), "");
    }
}
