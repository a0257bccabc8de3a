//! Worker-side reporting back to the current leader.
//!
//! Chunk and frame completion events are buffered and flushed over HTTP to
//! whoever currently leads. A single failed call puts the reporter into a
//! short cooldown and re-buffers the unsent tail ahead of newer reports so
//! per-chunk ordering is preserved. When this node is itself the leader the
//! HTTP hop is skipped and reports land straight in the dispatch queues.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{CompletionReport, DispatchQueues, FailureReport, FrameReport};
use crate::error::Result;
use crate::manifest::ChunkRange;
use crate::peers::PeerRegistry;

/// After any failed leader call, skip further leader contact this long.
pub const LEADER_COOLDOWN: Duration = Duration::from_secs(5);

/// Frame reports are batched and flushed at this cadence.
pub const FRAME_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

const LOOP_SLEEP: Duration = Duration::from_millis(50);
const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(2);
const REPORT_READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    Completed { elapsed_ms: i64, exit_code: i32 },
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub job_id: String,
    pub chunk: ChunkRange,
    pub outcome: ChunkOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMethod {
    Post,
    Delete,
}

/// One-off request to the leader (job controls, node unsuspend). The
/// optional channel reports whether the leader answered 200.
pub struct ControlRequest {
    pub path: String,
    pub method: ControlMethod,
    pub done: Option<oneshot::Sender<bool>>,
}

struct ReporterShared {
    chunk_reports: Mutex<Vec<ChunkReport>>,
    frame_reports: Mutex<Vec<FrameReport>>,
    control_tx: mpsc::UnboundedSender<ControlRequest>,
    /// Unix ms until which leader contact is suppressed. Also consulted by
    /// the worker-side job cache refresh.
    cooldown_until_ms: AtomicI64,
}

/// Cloneable producer half: render event routing and UI actions feed this.
#[derive(Clone)]
pub struct ReporterHandle {
    shared: Arc<ReporterShared>,
}

impl ReporterHandle {
    pub fn report_chunk(&self, report: ChunkReport) {
        lock(&self.shared.chunk_reports).push(report);
    }

    pub fn report_frame(&self, node_id: &str, job_id: &str, frame: i32) {
        lock(&self.shared.frame_reports).push(FrameReport {
            node_id: node_id.to_string(),
            job_id: job_id.to_string(),
            frame,
        });
    }

    pub fn control(
        &self,
        path: impl Into<String>,
        method: ControlMethod,
        done: Option<oneshot::Sender<bool>>,
    ) {
        let request = ControlRequest {
            path: path.into(),
            method,
            done,
        };
        if self.shared.control_tx.send(request).is_err() {
            tracing::warn!("reporter is gone, dropping control request");
        }
    }

    /// True while the leader-contact cooldown is active.
    pub fn in_cooldown(&self) -> bool {
        chrono::Utc::now().timestamp_millis() < self.shared.cooldown_until_ms.load(Ordering::SeqCst)
    }
}

pub struct RenderReporter {
    node_id: String,
    registry: Arc<PeerRegistry>,
    queues: Arc<DispatchQueues>,
    shared: Arc<ReporterShared>,
    control_rx: mpsc::UnboundedReceiver<ControlRequest>,
    http: reqwest::Client,
    last_frame_flush: Instant,
}

impl RenderReporter {
    pub fn new(
        node_id: impl Into<String>,
        registry: Arc<PeerRegistry>,
        queues: Arc<DispatchQueues>,
    ) -> Result<(Self, ReporterHandle)> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ReporterShared {
            chunk_reports: Mutex::new(Vec::new()),
            frame_reports: Mutex::new(Vec::new()),
            control_tx,
            cooldown_until_ms: AtomicI64::new(0),
        });
        let http = reqwest::Client::builder()
            .connect_timeout(CONTROL_CONNECT_TIMEOUT)
            .timeout(CONTROL_READ_TIMEOUT)
            .build()?;
        let reporter = Self {
            node_id: node_id.into(),
            registry,
            queues,
            shared: shared.clone(),
            control_rx,
            http,
            last_frame_flush: Instant::now(),
        };
        Ok((reporter, ReporterHandle { shared }))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(LOOP_SLEEP) => {}
            }

            while let Ok(request) = self.control_rx.try_recv() {
                self.execute_control(request).await;
            }

            if !self.in_cooldown() && self.flush_chunk_reports().await {
                self.start_cooldown();
            }

            if self.last_frame_flush.elapsed() >= FRAME_FLUSH_INTERVAL && !self.in_cooldown() {
                if self.flush_frame_reports().await {
                    self.start_cooldown();
                }
                self.last_frame_flush = Instant::now();
            }
        }
        tracing::info!("render reporter stopped");
    }

    fn in_cooldown(&self) -> bool {
        chrono::Utc::now().timestamp_millis() < self.shared.cooldown_until_ms.load(Ordering::SeqCst)
    }

    fn start_cooldown(&self) {
        self.shared.cooldown_until_ms.store(
            chrono::Utc::now().timestamp_millis() + LEADER_COOLDOWN.as_millis() as i64,
            Ordering::SeqCst,
        );
    }

    async fn execute_control(&self, request: ControlRequest) {
        let Some(leader) = self.registry.leader_endpoint() else {
            if let Some(done) = request.done {
                let _ = done.send(false);
            }
            return;
        };

        let url = format!("http://{leader}{}", request.path);
        let response = match request.method {
            ControlMethod::Post => self.http.post(&url).send().await,
            ControlMethod::Delete => self.http.delete(&url).send().await,
        };
        let success = matches!(&response, Ok(resp) if resp.status().is_success());
        if !success {
            tracing::warn!(path = %request.path, "leader control request failed");
        }
        if let Some(done) = request.done {
            let _ = done.send(success);
        }
    }

    /// Flush buffered chunk reports, one POST per report. Returns true when
    /// a send failed and a cooldown should start.
    async fn flush_chunk_reports(&self) -> bool {
        let batch = std::mem::take(&mut *lock(&self.shared.chunk_reports));
        if batch.is_empty() {
            return false;
        }

        // Leader shortcut: feed the local dispatch queues directly, no HTTP.
        if self.registry.is_local_leader() {
            for report in batch {
                self.enqueue_locally(report);
            }
            return false;
        }

        let Some(leader) = self.registry.leader_endpoint() else {
            prepend(&self.shared.chunk_reports, batch);
            return false;
        };

        let mut unsent = Vec::new();
        let mut any_failed = false;
        for report in batch {
            if any_failed {
                unsent.push(report);
                continue;
            }
            if self.post_chunk_report(&leader, &report).await.is_err() {
                any_failed = true;
                unsent.push(report);
            }
        }

        if !unsent.is_empty() {
            prepend(&self.shared.chunk_reports, unsent);
        }
        any_failed
    }

    fn enqueue_locally(&self, report: ChunkReport) {
        match report.outcome {
            ChunkOutcome::Completed {
                elapsed_ms,
                exit_code,
            } => self.queues.push_completion(CompletionReport {
                node_id: self.node_id.clone(),
                job_id: report.job_id,
                frame_start: report.chunk.frame_start,
                frame_end: report.chunk.frame_end,
                elapsed_ms,
                exit_code,
            }),
            ChunkOutcome::Failed { error } => self.queues.push_failure(FailureReport {
                node_id: self.node_id.clone(),
                job_id: report.job_id,
                frame_start: report.chunk.frame_start,
                frame_end: report.chunk.frame_end,
                error,
            }),
        }
    }

    async fn post_chunk_report(
        &self,
        leader: &str,
        report: &ChunkReport,
    ) -> std::result::Result<(), ()> {
        let (path, body) = match &report.outcome {
            ChunkOutcome::Completed {
                elapsed_ms,
                exit_code,
            } => (
                "/api/dispatch/complete",
                serde_json::json!({
                    "node_id": self.node_id,
                    "job_id": report.job_id,
                    "frame_start": report.chunk.frame_start,
                    "frame_end": report.chunk.frame_end,
                    "elapsed_ms": elapsed_ms,
                    "exit_code": exit_code,
                }),
            ),
            ChunkOutcome::Failed { error } => (
                "/api/dispatch/failed",
                serde_json::json!({
                    "node_id": self.node_id,
                    "job_id": report.job_id,
                    "frame_start": report.chunk.frame_start,
                    "frame_end": report.chunk.frame_end,
                    "error": error,
                }),
            ),
        };

        let url = format!("http://{leader}{path}");
        match self
            .http
            .post(&url)
            .timeout(REPORT_READ_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "chunk report rejected");
                Err(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "chunk report send failed");
                Err(())
            }
        }
    }

    /// Flush frame reports grouped by job, one POST per group.
    async fn flush_frame_reports(&self) -> bool {
        let batch = std::mem::take(&mut *lock(&self.shared.frame_reports));
        if batch.is_empty() {
            return false;
        }

        if self.registry.is_local_leader() {
            for report in batch {
                self.queues.push_frame(report);
            }
            return false;
        }

        let Some(leader) = self.registry.leader_endpoint() else {
            prepend(&self.shared.frame_reports, batch);
            return false;
        };

        let mut by_job: std::collections::HashMap<String, Vec<i32>> = Default::default();
        for report in &batch {
            by_job
                .entry(report.job_id.clone())
                .or_default()
                .push(report.frame);
        }

        let mut all_sent = true;
        for (job_id, frames) in by_job {
            let url = format!("http://{leader}/api/dispatch/frame-complete");
            let body = serde_json::json!({
                "node_id": self.node_id,
                "job_id": job_id,
                "frames": frames,
            });
            let sent = matches!(
                self.http.post(&url).timeout(REPORT_READ_TIMEOUT).json(&body).send().await,
                Ok(resp) if resp.status().is_success()
            );
            if !sent {
                all_sent = false;
            }
        }

        if !all_sent {
            prepend(&self.shared.frame_reports, batch);
        }
        !all_sent
    }
}

fn lock<T>(mutex: &Mutex<Vec<T>>) -> std::sync::MutexGuard<'_, Vec<T>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Put unsent items back in front of anything that arrived during the flush.
fn prepend<T>(mutex: &Mutex<Vec<T>>, mut unsent: Vec<T>) {
    let mut buffer = lock(mutex);
    unsent.append(&mut buffer);
    *buffer = unsent;
}
