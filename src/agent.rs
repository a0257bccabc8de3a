//! Built-in render agent.
//!
//! Production farms run a dedicated agent process wired to the render
//! application over IPC; this built-in fallback executes the manifest's
//! shell command directly so a node built from this crate alone can render.
//! It consumes the same [`AgentEndpoint`] seam an external supervisor would.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::manifest::{ChunkRange, JobManifest};
use crate::render::{AgentEndpoint, RenderEvent};

pub async fn run(mut endpoint: AgentEndpoint, cancel: CancellationToken) {
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = endpoint.tasks.recv() => task,
        };
        let Some(task) = task else { break };

        let events = endpoint.events.clone();
        let mut cancelled_job = endpoint.cancelled_job.clone();
        execute(
            task.manifest,
            task.chunk,
            &events,
            &mut cancelled_job,
            &cancel,
        )
        .await;
    }
    tracing::info!("render agent stopped");
}

async fn execute(
    manifest: JobManifest,
    chunk: ChunkRange,
    events: &mpsc::Sender<RenderEvent>,
    cancelled_job: &mut watch::Receiver<Option<String>>,
    cancel: &CancellationToken,
) {
    let started = Instant::now();
    let job_id = manifest.job_id.clone();

    let Some(template) = shell_template(&manifest) else {
        let _ = events
            .send(RenderEvent::ChunkFailed {
                job_id,
                chunk,
                error: "manifest has no runnable command".to_string(),
            })
            .await;
        return;
    };

    let per_frame = manifest
        .command
        .get("per_frame")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    tracing::info!(job_id = %job_id, chunk = %chunk, per_frame, "render starting");

    if per_frame {
        for frame in chunk.frames() {
            let command = substitute(&template, &manifest, chunk, Some(frame));
            match run_command(&command, &job_id, cancelled_job, cancel).await {
                CommandResult::Success(_) => {
                    let _ = events
                        .send(RenderEvent::FrameCompleted {
                            job_id: job_id.clone(),
                            frame,
                        })
                        .await;
                }
                CommandResult::Failure(exit_code, error) => {
                    let _ = events
                        .send(RenderEvent::ChunkFailed {
                            job_id,
                            chunk,
                            error: format!("frame {frame} exited {exit_code}: {error}"),
                        })
                        .await;
                    return;
                }
                CommandResult::Aborted => return,
            }
        }
        let _ = events
            .send(RenderEvent::ChunkCompleted {
                job_id,
                chunk,
                elapsed_ms: started.elapsed().as_millis() as i64,
                exit_code: 0,
            })
            .await;
    } else {
        let command = substitute(&template, &manifest, chunk, None);
        match run_command(&command, &job_id, cancelled_job, cancel).await {
            CommandResult::Success(exit_code) => {
                let _ = events
                    .send(RenderEvent::ChunkCompleted {
                        job_id,
                        chunk,
                        elapsed_ms: started.elapsed().as_millis() as i64,
                        exit_code,
                    })
                    .await;
            }
            CommandResult::Failure(exit_code, error) => {
                let _ = events
                    .send(RenderEvent::ChunkFailed {
                        job_id,
                        chunk,
                        error: format!("exited {exit_code}: {error}"),
                    })
                    .await;
            }
            CommandResult::Aborted => {}
        }
    }
}

enum CommandResult {
    Success(i32),
    Failure(i32, String),
    /// Killed by cancellation; the abort already cleared the render slot,
    /// so no completion or failure report is owed.
    Aborted,
}

async fn run_command(
    command: &str,
    job_id: &str,
    cancelled_job: &mut watch::Receiver<Option<String>>,
    cancel: &CancellationToken,
) -> CommandResult {
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return CommandResult::Failure(-1, err.to_string()),
    };

    let stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buffer = String::new();
        if let Some(mut pipe) = stderr_pipe {
            let _ = pipe.read_to_string(&mut buffer).await;
        }
        buffer
    });

    enum Next {
        Exited(std::io::Result<std::process::ExitStatus>),
        CancelChanged,
        Shutdown,
    }

    loop {
        // Branch bodies stay free of `child` borrows; the kill happens
        // after the select statement so the wait future is gone.
        let next = tokio::select! {
            status = child.wait() => Next::Exited(status),
            changed = cancelled_job.changed() => {
                if changed.is_err() { Next::Shutdown } else { Next::CancelChanged }
            }
            _ = cancel.cancelled() => Next::Shutdown,
        };

        match next {
            Next::Exited(status) => {
                let stderr = stderr_task.await.unwrap_or_default();
                return match status {
                    Ok(status) if status.success() => {
                        CommandResult::Success(status.code().unwrap_or(0))
                    }
                    Ok(status) => {
                        let code = status.code().unwrap_or(-1);
                        CommandResult::Failure(code, stderr.trim().to_string())
                    }
                    Err(err) => CommandResult::Failure(-1, err.to_string()),
                };
            }
            Next::CancelChanged => {
                let matches = cancelled_job.borrow().as_deref() == Some(job_id);
                if matches {
                    tracing::info!(job_id = %job_id, "aborting render");
                    let _ = child.kill().await;
                    return CommandResult::Aborted;
                }
            }
            Next::Shutdown => {
                tracing::info!(job_id = %job_id, "aborting render for shutdown");
                let _ = child.kill().await;
                return CommandResult::Aborted;
            }
        }
    }
}

/// Extract the shell command template: the `command` descriptor may be a
/// bare string or an object with a `shell` field.
fn shell_template(manifest: &JobManifest) -> Option<String> {
    if let Some(command) = manifest.command.as_str() {
        return Some(command.to_string());
    }
    manifest
        .command
        .get("shell")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Replace `{frame_start}`, `{frame_end}`, `{frame}`, `{job_id}` and
/// `{output_dir}` tokens in the command template.
fn substitute(
    template: &str,
    manifest: &JobManifest,
    chunk: ChunkRange,
    frame: Option<i32>,
) -> String {
    let mut command = template
        .replace("{frame_start}", &chunk.frame_start.to_string())
        .replace("{frame_end}", &chunk.frame_end.to_string())
        .replace("{job_id}", &manifest.job_id);
    if let Some(frame) = frame {
        command = command.replace("{frame}", &frame.to_string());
    }
    if let Some(output_dir) = &manifest.output_dir {
        command = command.replace("{output_dir}", output_dir);
    }
    command
}
