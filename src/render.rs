//! The seam between the farm core and the local render executor.
//!
//! The executor (a separate agent process spoken to over local IPC) is out
//! of scope here: the core only hands it task descriptors and consumes the
//! typed progress events it emits. [`RenderQueue`] is the sink side used by
//! the dispatcher and the assignment handler; [`AgentEndpoint`] is what the
//! agent supervisor plugs into.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::error::{FarmError, Result};
use crate::manifest::{ChunkRange, JobManifest};
use crate::peers::{NodeState, PeerRegistry, RenderState};

#[derive(Debug, Clone)]
pub struct RenderTask {
    pub manifest: JobManifest,
    pub chunk: ChunkRange,
}

#[derive(Debug, Clone)]
pub enum RenderEvent {
    FrameCompleted {
        job_id: String,
        frame: i32,
    },
    ChunkCompleted {
        job_id: String,
        chunk: ChunkRange,
        elapsed_ms: i64,
        exit_code: i32,
    },
    ChunkFailed {
        job_id: String,
        chunk: ChunkRange,
        error: String,
    },
}

struct QueueInner {
    registry: Arc<PeerRegistry>,
    tasks: mpsc::Sender<RenderTask>,
    cancelled_job: watch::Sender<Option<String>>,
}

/// Accepts render work for this node, enforcing the same rules the HTTP
/// assignment endpoint enforces: a stopped node takes nothing, a rendering
/// node takes nothing.
#[derive(Clone)]
pub struct RenderQueue {
    inner: Arc<QueueInner>,
}

impl RenderQueue {
    pub fn dispatch(&self, task: RenderTask) -> Result<()> {
        if self.inner.registry.local_node_state() == NodeState::Stopped {
            return Err(FarmError::Stopped);
        }
        let (render_state, _, _) = self.inner.registry.local_render_state();
        if render_state == RenderState::Rendering {
            return Err(FarmError::Busy);
        }

        self.inner.registry.set_local_render_state(
            RenderState::Rendering,
            &task.manifest.job_id,
            &task.chunk.label(),
        );
        if self.inner.tasks.try_send(task).is_err() {
            self.inner
                .registry
                .set_local_render_state(RenderState::Idle, "", "");
            return Err(FarmError::Busy);
        }
        Ok(())
    }

    /// Ask the agent to abort any render of this job and drop the active
    /// slot if it matches. Used by job cancellation.
    pub fn cancel_job(&self, job_id: &str) {
        let (state, active_job, _) = self.inner.registry.local_render_state();
        if state == RenderState::Rendering && active_job == job_id {
            self.inner
                .registry
                .set_local_render_state(RenderState::Idle, "", "");
        }
        let _ = self.inner.cancelled_job.send(Some(job_id.to_string()));
    }
}

/// The agent supervisor's side of the seam.
pub struct AgentEndpoint {
    pub tasks: mpsc::Receiver<RenderTask>,
    pub events: mpsc::Sender<RenderEvent>,
    pub cancelled_job: watch::Receiver<Option<String>>,
}

/// Build the render seam. Returns the core-side queue, the agent-side
/// endpoint, and the stream of events the node routes into reporting.
pub fn render_channel(
    registry: Arc<PeerRegistry>,
) -> (RenderQueue, AgentEndpoint, mpsc::Receiver<RenderEvent>) {
    let (task_tx, task_rx) = mpsc::channel(4);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (cancel_tx, cancel_rx) = watch::channel(None);

    let queue = RenderQueue {
        inner: Arc::new(QueueInner {
            registry,
            tasks: task_tx,
            cancelled_job: cancel_tx,
        }),
    };
    let endpoint = AgentEndpoint {
        tasks: task_rx,
        events: event_tx,
        cancelled_job: cancel_rx,
    };
    (queue, endpoint, event_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manifest(job_id: &str) -> JobManifest {
        JobManifest {
            job_id: job_id.into(),
            template_id: "t".into(),
            submitted_by: "tester".into(),
            submitted_at_ms: 0,
            frame_start: 1,
            frame_end: 10,
            chunk_size: 5,
            max_retries: 3,
            timeout_seconds: None,
            output_dir: None,
            tags_required: Vec::new(),
            command: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn dispatch_marks_node_rendering() {
        let registry = Arc::new(PeerRegistry::new("local", Vec::new()));
        let (queue, mut endpoint, _events) = render_channel(registry.clone());

        queue
            .dispatch(RenderTask {
                manifest: test_manifest("shot-010"),
                chunk: ChunkRange::new(1, 5),
            })
            .unwrap();

        let (state, job, chunk) = registry.local_render_state();
        assert_eq!(state, RenderState::Rendering);
        assert_eq!(job, "shot-010");
        assert_eq!(chunk, "f1-5");
        assert!(endpoint.tasks.try_recv().is_ok());
    }

    #[tokio::test]
    async fn busy_node_rejects_second_dispatch() {
        let registry = Arc::new(PeerRegistry::new("local", Vec::new()));
        let (queue, _endpoint, _events) = render_channel(registry);

        queue
            .dispatch(RenderTask {
                manifest: test_manifest("a"),
                chunk: ChunkRange::new(1, 5),
            })
            .unwrap();
        let second = queue.dispatch(RenderTask {
            manifest: test_manifest("b"),
            chunk: ChunkRange::new(6, 10),
        });
        assert!(matches!(second, Err(FarmError::Busy)));
    }

    #[tokio::test]
    async fn stopped_node_rejects_dispatch() {
        let registry = Arc::new(PeerRegistry::new("local", Vec::new()));
        registry.set_local_node_state(NodeState::Stopped);
        let (queue, _endpoint, _events) = render_channel(registry);

        let result = queue.dispatch(RenderTask {
            manifest: test_manifest("a"),
            chunk: ChunkRange::new(1, 5),
        });
        assert!(matches!(result, Err(FarmError::Stopped)));
    }

    #[tokio::test]
    async fn cancel_clears_matching_active_render() {
        let registry = Arc::new(PeerRegistry::new("local", Vec::new()));
        let (queue, endpoint, _events) = render_channel(registry.clone());

        queue
            .dispatch(RenderTask {
                manifest: test_manifest("shot-010"),
                chunk: ChunkRange::new(1, 5),
            })
            .unwrap();
        queue.cancel_job("some-other-job");
        assert_eq!(registry.local_render_state().0, RenderState::Rendering);

        queue.cancel_job("shot-010");
        assert_eq!(registry.local_render_state().0, RenderState::Idle);
        assert_eq!(
            endpoint.cancelled_job.borrow().as_deref(),
            Some("shot-010")
        );
    }
}
