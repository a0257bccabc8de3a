//! Inbound queues between the HTTP handlers and the dispatcher tick.
//!
//! Producers are request handlers on the server's worker threads; the sole
//! consumer is the dispatcher. Draining swaps the whole queue out under the
//! lock so producers are never blocked while the dispatcher iterates.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::manifest::JobManifest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    #[serde(default)]
    pub node_id: String,
    pub job_id: String,
    pub frame_start: i32,
    pub frame_end: i32,
    #[serde(default)]
    pub elapsed_ms: i64,
    #[serde(default)]
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    #[serde(default)]
    pub node_id: String,
    pub job_id: String,
    pub frame_start: i32,
    pub frame_end: i32,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameReport {
    #[serde(default)]
    pub node_id: String,
    pub job_id: String,
    pub frame: i32,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub manifest: JobManifest,
    pub priority: i32,
}

#[derive(Debug, Default)]
pub struct DispatchQueues {
    submissions: Mutex<Vec<SubmitRequest>>,
    completions: Mutex<Vec<CompletionReport>>,
    failures: Mutex<Vec<FailureReport>>,
    frames: Mutex<Vec<FrameReport>>,
}

impl DispatchQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_submission(&self, request: SubmitRequest) {
        lock(&self.submissions).push(request);
    }

    pub fn push_completion(&self, report: CompletionReport) {
        lock(&self.completions).push(report);
    }

    pub fn push_failure(&self, report: FailureReport) {
        lock(&self.failures).push(report);
    }

    pub fn push_frame(&self, report: FrameReport) {
        lock(&self.frames).push(report);
    }

    pub fn drain_submissions(&self) -> Vec<SubmitRequest> {
        std::mem::take(&mut *lock(&self.submissions))
    }

    pub fn drain_completions(&self) -> Vec<CompletionReport> {
        std::mem::take(&mut *lock(&self.completions))
    }

    pub fn drain_failures(&self) -> Vec<FailureReport> {
        std::mem::take(&mut *lock(&self.failures))
    }

    pub fn drain_frames(&self) -> Vec<FrameReport> {
        std::mem::take(&mut *lock(&self.frames))
    }
}

fn lock<T>(mutex: &Mutex<Vec<T>>) -> std::sync::MutexGuard<'_, Vec<T>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_takes_everything_and_resets() {
        let queues = DispatchQueues::new();
        queues.push_frame(FrameReport {
            node_id: "a".into(),
            job_id: "job".into(),
            frame: 1,
        });
        queues.push_frame(FrameReport {
            node_id: "a".into(),
            job_id: "job".into(),
            frame: 2,
        });

        assert_eq!(queues.drain_frames().len(), 2);
        assert!(queues.drain_frames().is_empty());
    }

    #[test]
    fn report_bodies_tolerate_missing_optionals() {
        let report: CompletionReport = serde_json::from_str(
            r#"{"job_id":"shot","frame_start":1,"frame_end":5}"#,
        )
        .unwrap();
        assert_eq!(report.elapsed_ms, 0);
        assert_eq!(report.exit_code, 0);
        assert!(report.node_id.is_empty());

        let failure: FailureReport =
            serde_json::from_str(r#"{"job_id":"shot","frame_start":1,"frame_end":5}"#).unwrap();
        assert!(failure.error.is_empty());
    }
}
