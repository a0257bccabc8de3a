//! Filesystem + HTTP peer discovery.
//!
//! One tick every ~3 s: publish our own endpoint descriptor, scan the shared
//! nodes directory for new peers, poll known peers over HTTP (skipping ones
//! already fresh via UDP), purge vanished peers, and recompute the leader.
//! The shared filesystem and HTTP remain authoritative; multicast only
//! accelerates them.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::info::{PeerEndpoint, PeerInfo};
use super::registry::{PeerRegistry, PeerUpdate};
use crate::error::Result;
use crate::farmfs::{self, FarmPaths};

pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(3);

const POLL_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_READ_TIMEOUT: Duration = Duration::from_secs(3);

pub struct DiscoveryPlane {
    registry: Arc<PeerRegistry>,
    paths: FarmPaths,
    local_ip: String,
    http_port: u16,
    http: reqwest::Client,
}

impl DiscoveryPlane {
    pub fn new(
        registry: Arc<PeerRegistry>,
        paths: FarmPaths,
        local_ip: String,
        http_port: u16,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(POLL_CONNECT_TIMEOUT)
            .timeout(POLL_READ_TIMEOUT)
            .build()?;
        Ok(Self {
            registry,
            paths,
            local_ip,
            http_port,
            http,
        })
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            endpoint = %format!("{}:{}", self.local_ip, self.http_port),
            "discovery plane started"
        );
        let mut interval = tokio::time::interval(DISCOVERY_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
        self.remove_endpoint();
        tracing::info!("discovery plane stopped");
    }

    pub async fn tick(&self) {
        self.write_endpoint();
        self.scan_nodes();
        self.poll_peers().await;
        self.purge();
        self.registry.recompute_leader();
    }

    /// Publish our endpoint descriptor. Refreshed every tick so a vanished
    /// descriptor (farm cleanup, admin deletion) heals itself.
    fn write_endpoint(&self) {
        let descriptor = PeerEndpoint {
            node_id: self.registry.local_node_id().to_string(),
            ip: self.local_ip.clone(),
            port: self.http_port,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        let path = self.paths.endpoint_file(self.registry.local_node_id());
        if let Err(err) = farmfs::write_json_atomic(&path, &descriptor) {
            tracing::warn!(error = %err, "failed to write endpoint descriptor");
        }
    }

    fn remove_endpoint(&self) {
        let path = self.paths.endpoint_file(self.registry.local_node_id());
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::debug!(error = %err, "could not remove endpoint descriptor");
        }
    }

    /// Register any node directory with an endpoint descriptor we have not
    /// seen yet. Malformed descriptors are skipped; the owner rewrites them
    /// every tick.
    fn scan_nodes(&self) {
        let nodes_dir = self.paths.nodes_dir();
        let entries = match std::fs::read_dir(&nodes_dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "cannot scan nodes directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let node_id = entry.file_name().to_string_lossy().to_string();
            if node_id == self.registry.local_node_id() || self.registry.contains(&node_id) {
                continue;
            }
            let descriptor_path = entry.path().join("endpoint.json");
            let Ok(text) = std::fs::read_to_string(&descriptor_path) else {
                continue;
            };
            match serde_json::from_str::<PeerEndpoint>(&text) {
                Ok(descriptor) => {
                    self.registry.apply(PeerUpdate::Discovered {
                        node_id: descriptor.node_id,
                        endpoint: format!("{}:{}", descriptor.ip, descriptor.port),
                    });
                }
                Err(err) => {
                    tracing::debug!(path = %descriptor_path.display(), error = %err,
                        "skipping malformed endpoint descriptor");
                }
            }
        }
    }

    async fn poll_peers(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.registry.expire_udp_contact(now_ms);

        for (node_id, endpoint) in self.registry.poll_candidates(now_ms) {
            let url = format!("http://{endpoint}/api/status");
            let polled = match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => resp.json::<PeerInfo>().await.ok(),
                _ => None,
            };
            match polled {
                Some(info) => {
                    self.registry.apply(PeerUpdate::HttpStatus {
                        node_id,
                        info,
                        now_ms: chrono::Utc::now().timestamp_millis(),
                    });
                }
                None => {
                    self.registry.apply(PeerUpdate::HttpPollFailed { node_id });
                }
            }
        }
    }

    fn purge(&self) {
        self.registry
            .purge_dead(|node_id| self.paths.endpoint_file(node_id).exists());
    }
}
