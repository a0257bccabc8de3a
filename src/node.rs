//! The farm node: one long-lived object owning every component handle.
//!
//! All cross-component wiring happens here — queues and callbacks are
//! passed into each worker at construction, so no component reaches back
//! into the node by name. Leader role transitions (snapshot restore on
//! gain, database close on loss) are serialized through a single one-shot
//! task that is always joined before the next transition.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState, NodeControl};
use crate::config::NodeConfig;
use crate::dispatch::dispatcher::SharedStore;
use crate::dispatch::{DispatchQueues, Dispatcher, FailureTracker};
use crate::error::{FarmError, Result};
use crate::farmfs::{self, FarmPaths, APP_VERSION};
use crate::identity;
use crate::peers::multicast::MulticastPlane;
use crate::peers::{
    detect_local_ip, DiscoveryPlane, NodeState, PeerInfo, PeerRegistry, RenderState,
};
use crate::render::{self, AgentEndpoint, RenderEvent, RenderQueue};
use crate::reporter::{ChunkOutcome, ChunkReport, RenderReporter, ReporterHandle};
use crate::store::Store;

pub struct FarmNode {
    config: Arc<Mutex<NodeConfig>>,
    config_path: PathBuf,
    data_dir: PathBuf,
    node_id: String,
    registry: Arc<PeerRegistry>,
    render_queue: RenderQueue,
    render_events: mpsc::Receiver<RenderEvent>,
}

impl FarmNode {
    /// Build the node and its render seam. The returned [`AgentEndpoint`]
    /// is what the render agent supervisor plugs into; dropping it leaves
    /// the node coordinating without accepting local render work.
    pub fn new(config: NodeConfig, data_dir: PathBuf) -> Result<(Self, AgentEndpoint)> {
        let node_id = identity::load_or_generate(&data_dir)?;
        let registry = Arc::new(PeerRegistry::new(node_id.clone(), config.tags.clone()));
        if config.node_stopped {
            registry.set_local_node_state(NodeState::Stopped);
        }

        let (render_queue, agent_endpoint, render_events) =
            render::render_channel(registry.clone());
        let config_path = data_dir.join("config.json");

        let node = Self {
            config: Arc::new(Mutex::new(config)),
            config_path,
            data_dir,
            node_id,
            registry,
            render_queue,
            render_events,
        };
        Ok((node, agent_endpoint))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run the farm until `cancel` fires. A cancelled node finishes any
    /// in-flight local render before shutting down unless `force` fires.
    pub async fn run(self, cancel: CancellationToken, force: CancellationToken) -> Result<()> {
        let FarmNode {
            config,
            config_path,
            data_dir,
            node_id,
            registry,
            render_queue,
            render_events,
        } = self;

        let (sync_root, http_port, udp_enabled, udp_port, priority, ip_override) = {
            let config = lock_config(&config);
            (
                config.sync_root.clone(),
                config.http_port,
                config.udp_enabled,
                config.udp_port,
                config.priority,
                config.ip_override.clone(),
            )
        };

        if sync_root.is_empty() || !std::path::Path::new(&sync_root).is_dir() {
            return Err(FarmError::Fatal(format!(
                "sync root does not exist: {sync_root}"
            )));
        }

        let paths = FarmPaths::new(std::path::Path::new(&sync_root));
        farmfs::ensure_layout(&paths, &node_id)?;

        let local_ip = if ip_override.is_empty() {
            detect_local_ip()
        } else {
            ip_override
        };
        let local_endpoint = format!("{local_ip}:{http_port}");
        registry.set_local_descriptor(local_descriptor(&node_id, &config, &local_endpoint));
        tracing::info!(
            node_id = %node_id,
            endpoint = %local_endpoint,
            farm = %paths.root().display(),
            "farm starting"
        );

        // Bind the mesh port before spawning anything; a taken port is fatal.
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", http_port))
            .await
            .map_err(|err| {
                FarmError::Fatal(format!("failed to bind http port {http_port}: {err}"))
            })?;

        let queues = Arc::new(DispatchQueues::new());
        let failures = Arc::new(FailureTracker::new());
        let store: SharedStore = Arc::new(tokio::sync::RwLock::new(None));
        let leader_ready = Arc::new(AtomicBool::new(false));

        let (reporter, reporter_handle) =
            RenderReporter::new(node_id.clone(), registry.clone(), queues.clone())?;

        let workers = CancellationToken::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // Render event routing: executor events become reports.
        handles.push(tokio::spawn(route_render_events(
            render_events,
            registry.clone(),
            reporter_handle.clone(),
            node_id.clone(),
            workers.clone(),
        )));

        // Discovery plane.
        let discovery = DiscoveryPlane::new(
            registry.clone(),
            paths.clone(),
            local_ip.clone(),
            http_port,
        )?;
        handles.push(tokio::spawn(discovery.run(workers.clone())));

        // Multicast fast path (optional; the farm runs HTTP-only without it).
        if udp_enabled {
            match MulticastPlane::bind(udp_port).await {
                Ok(plane) => {
                    let plane = Arc::new(plane);
                    handles.push(tokio::spawn(
                        plane.clone().run_receiver(registry.clone(), workers.clone()),
                    ));
                    handles.push(tokio::spawn(plane.run_heartbeat(
                        registry.clone(),
                        local_ip.clone(),
                        http_port,
                        priority,
                        workers.clone(),
                    )));
                    tracing::info!(port = udp_port, "udp multicast active");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "udp multicast failed to start, running http-only");
                }
            }
        }

        // Worker-side reporter.
        handles.push(tokio::spawn(reporter.run(workers.clone())));

        // Leader-only dispatcher.
        let dispatcher = Dispatcher::new(
            registry.clone(),
            queues.clone(),
            failures.clone(),
            store.clone(),
            render_queue.clone(),
            paths.clone(),
            data_dir.clone(),
        )?;
        handles.push(tokio::spawn(
            dispatcher.run(leader_ready.clone(), workers.clone()),
        ));

        // Leader role transitions.
        handles.push(tokio::spawn(leader_role_loop(
            registry.clone(),
            store.clone(),
            leader_ready.clone(),
            paths.clone(),
            data_dir.join("midrender.db"),
            workers.clone(),
        )));

        // Mesh API server.
        let api_state = ApiState {
            registry: registry.clone(),
            queues,
            store: store.clone(),
            leader_ready,
            failures,
            render: render_queue.clone(),
            paths,
            node_ctl: node_control(registry.clone(), render_queue, config, config_path),
        };
        let server_cancel = workers.clone();
        handles.push(tokio::spawn(async move {
            let app = api::router(api_state);
            tracing::info!("mesh api listening");
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                .await;
            if let Err(err) = served {
                tracing::error!(error = %err, "mesh api server failed");
            }
        }));

        // Wait for shutdown, deferring while a local render is in flight.
        cancel.cancelled().await;
        await_local_render(&registry, &force).await;

        workers.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        store.write().await.take();
        tracing::info!("farm stopped");
        Ok(())
    }
}

fn lock_config(config: &Arc<Mutex<NodeConfig>>) -> std::sync::MutexGuard<'_, NodeConfig> {
    config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The static half of this node's peer status: identity and hardware.
fn local_descriptor(node_id: &str, config: &Arc<Mutex<NodeConfig>>, endpoint: &str) -> PeerInfo {
    let system = sysinfo::System::new_all();
    let config = lock_config(config);
    let mut info = PeerInfo::minimal(node_id.to_string(), endpoint);
    info.hostname = sysinfo::System::host_name().unwrap_or_default();
    info.os = std::env::consts::OS.to_string();
    info.app_version = APP_VERSION.to_string();
    info.cpu_cores = system.cpus().len() as u32;
    info.ram_mb = system.total_memory() / (1024 * 1024);
    info.priority = config.priority;
    info.tags = config.tags.clone();
    info
}

/// Stop/start callback for the mesh API. Stopping aborts the active render;
/// the state change is persisted across restarts.
fn node_control(
    registry: Arc<PeerRegistry>,
    render: RenderQueue,
    config: Arc<Mutex<NodeConfig>>,
    config_path: PathBuf,
) -> NodeControl {
    NodeControl::new(move |state| {
        registry.set_local_node_state(state);
        if state == NodeState::Stopped {
            let (_, active_job, _) = registry.local_render_state();
            if !active_job.is_empty() {
                render.cancel_job(&active_job);
            }
        }
        let mut config = lock_config(&config);
        config.node_stopped = state == NodeState::Stopped;
        if let Err(err) = config.save(&config_path) {
            tracing::warn!(error = %err, "failed to persist node state");
        }
    })
}

async fn await_local_render(registry: &PeerRegistry, force: &CancellationToken) {
    loop {
        let (state, job, _) = registry.local_render_state();
        if state == RenderState::Idle {
            return;
        }
        tracing::info!(job_id = %job, "waiting for local render before exit");
        tokio::select! {
            _ = force.cancelled() => {
                tracing::warn!("force exit, abandoning local render");
                return;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
        }
    }
}

/// Translate executor events into registry state and outbound reports.
async fn route_render_events(
    mut events: mpsc::Receiver<RenderEvent>,
    registry: Arc<PeerRegistry>,
    reporter: ReporterHandle,
    node_id: String,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        match event {
            RenderEvent::FrameCompleted { job_id, frame } => {
                reporter.report_frame(&node_id, &job_id, frame);
            }
            RenderEvent::ChunkCompleted {
                job_id,
                chunk,
                elapsed_ms,
                exit_code,
            } => {
                registry.set_local_render_state(RenderState::Idle, "", "");
                tracing::info!(job_id = %job_id, chunk = %chunk, elapsed_ms, "local chunk completed");
                reporter.report_chunk(ChunkReport {
                    job_id,
                    chunk,
                    outcome: ChunkOutcome::Completed {
                        elapsed_ms,
                        exit_code,
                    },
                });
            }
            RenderEvent::ChunkFailed {
                job_id,
                chunk,
                error,
            } => {
                registry.set_local_render_state(RenderState::Idle, "", "");
                tracing::warn!(job_id = %job_id, chunk = %chunk, error = %error, "local chunk failed");
                reporter.report_chunk(ChunkReport {
                    job_id,
                    chunk,
                    outcome: ChunkOutcome::Failed { error },
                });
            }
        }
    }
}

/// Watch for leadership changes and run the role transition protocol:
/// gain → restore snapshot (or open fresh) off-thread, validate, publish
/// readiness; loss → join any in-flight transition, close the database.
async fn leader_role_loop(
    registry: Arc<PeerRegistry>,
    store: SharedStore,
    leader_ready: Arc<AtomicBool>,
    paths: FarmPaths,
    local_db_path: PathBuf,
    cancel: CancellationToken,
) {
    let mut was_leader = false;
    let mut transition: Option<JoinHandle<()>> = None;
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let is_leader = registry.is_local_leader();
        if is_leader && !was_leader {
            if let Some(previous) = transition.take() {
                let _ = previous.await;
            }
            leader_ready.store(false, Ordering::SeqCst);
            transition = Some(tokio::spawn(become_leader(
                store.clone(),
                leader_ready.clone(),
                paths.snapshot_file(),
                local_db_path.clone(),
            )));
        } else if !is_leader && was_leader {
            if let Some(previous) = transition.take() {
                let _ = previous.await;
            }
            leader_ready.store(false, Ordering::SeqCst);
            store.write().await.take();
            tracing::info!("no longer leader, database closed");
        }
        was_leader = is_leader;
    }

    if let Some(previous) = transition.take() {
        let _ = previous.await;
    }
}

async fn become_leader(
    store: SharedStore,
    leader_ready: Arc<AtomicBool>,
    snapshot_path: PathBuf,
    local_db_path: PathBuf,
) {
    tracing::info!("this node is now leader, initializing database");

    let opened = tokio::task::spawn_blocking(move || {
        if snapshot_path.exists() {
            match Store::restore_from(&snapshot_path, &local_db_path) {
                Ok(restored) => {
                    tracing::info!("database restored from snapshot");
                    return Ok(restored);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "snapshot restore failed, opening fresh database");
                }
            }
        }
        Store::open(&local_db_path)
    })
    .await;

    match opened {
        Ok(Ok(opened)) => {
            *store.write().await = Some(opened);
            leader_ready.store(true, Ordering::SeqCst);
            tracing::info!("leader database ready");
        }
        Ok(Err(err)) => {
            tracing::error!(error = %err, "failed to open leader database, refusing to lead");
        }
        Err(err) => {
            tracing::error!(error = %err, "leader database task panicked");
        }
    }
}
