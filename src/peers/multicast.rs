//! UDP multicast fast path for peer state.
//!
//! A heartbeat datagram every ~3 s carries the fields peers need to make
//! dispatch decisions quickly; a farewell datagram is sent on clean stop.
//! Datagrams feed the registry as fast-path updates only — the filesystem
//! and HTTP discovery paths remain the source of truth.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::info::{NodeState, RenderState};
use super::registry::{PeerRegistry, PeerUpdate};
use crate::error::Result;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 66, 77, 82);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Wire format shared by every node on the mesh port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Datagram {
    #[serde(rename = "hb")]
    Heartbeat {
        n: String,
        ip: String,
        port: u16,
        st: NodeState,
        rs: RenderState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk: Option<String>,
        pri: i32,
    },
    #[serde(rename = "bye")]
    Goodbye { n: String },
}

pub struct MulticastPlane {
    socket: UdpSocket,
    target: std::net::SocketAddr,
}

impl MulticastPlane {
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;
        Ok(Self {
            socket,
            target: (MULTICAST_GROUP, port).into(),
        })
    }

    pub async fn send(&self, datagram: &Datagram) -> Result<()> {
        let body = serde_json::to_vec(datagram)?;
        self.socket.send_to(&body, self.target).await?;
        Ok(())
    }

    /// Receive loop: parse datagrams and route them into the registry.
    pub async fn run_receiver(
        self: Arc<Self>,
        registry: Arc<PeerRegistry>,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; 2048];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let len = match received {
                Ok((len, _src)) => len,
                Err(err) => {
                    tracing::warn!(error = %err, "multicast receive failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            match serde_json::from_slice::<Datagram>(&buf[..len]) {
                Ok(datagram) => handle_datagram(&registry, datagram),
                Err(err) => {
                    tracing::debug!(error = %err, "ignoring malformed datagram");
                }
            }
        }
        tracing::info!("multicast receiver stopped");
    }

    /// Heartbeat loop: announce local state every tick, farewell on stop.
    pub async fn run_heartbeat(
        self: Arc<Self>,
        registry: Arc<PeerRegistry>,
        local_ip: String,
        http_port: u16,
        priority: i32,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let (render_state, active_job, active_chunk) = registry.local_render_state();
            let heartbeat = Datagram::Heartbeat {
                n: registry.local_node_id().to_string(),
                ip: local_ip.clone(),
                port: http_port,
                st: registry.local_node_state(),
                rs: render_state,
                job: (!active_job.is_empty()).then_some(active_job),
                chunk: (!active_chunk.is_empty()).then_some(active_chunk),
                pri: priority,
            };
            if let Err(err) = self.send(&heartbeat).await {
                tracing::debug!(error = %err, "heartbeat send failed");
            }
        }

        let goodbye = Datagram::Goodbye {
            n: registry.local_node_id().to_string(),
        };
        if let Err(err) = self.send(&goodbye).await {
            tracing::debug!(error = %err, "goodbye send failed");
        }
        tracing::info!("multicast heartbeat stopped");
    }
}

fn handle_datagram(registry: &PeerRegistry, datagram: Datagram) {
    match datagram {
        Datagram::Heartbeat {
            n,
            ip,
            port,
            st,
            rs,
            job,
            chunk,
            pri,
        } => {
            if n.is_empty() || n == registry.local_node_id() {
                return;
            }
            registry.apply(PeerUpdate::UdpHeartbeat {
                node_id: n,
                endpoint: format!("{ip}:{port}"),
                node_state: st,
                render_state: rs,
                active_job: job.unwrap_or_default(),
                active_chunk: chunk.unwrap_or_default(),
                priority: pri,
                now_ms: chrono::Utc::now().timestamp_millis(),
            });
        }
        Datagram::Goodbye { n } => {
            if n.is_empty() || n == registry.local_node_id() {
                return;
            }
            registry.apply(PeerUpdate::UdpGoodbye { node_id: n });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_uses_compact_field_names() {
        let datagram = Datagram::Heartbeat {
            n: "node-a".into(),
            ip: "10.0.0.1".into(),
            port: 8420,
            st: NodeState::Active,
            rs: RenderState::Rendering,
            job: Some("shot-010".into()),
            chunk: Some("f1-10".into()),
            pri: 50,
        };
        let json = serde_json::to_value(&datagram).unwrap();
        assert_eq!(json["t"], "hb");
        assert_eq!(json["n"], "node-a");
        assert_eq!(json["st"], "active");
        assert_eq!(json["rs"], "rendering");
        assert_eq!(json["pri"], 50);
    }

    #[test]
    fn idle_heartbeat_omits_job_fields() {
        let datagram = Datagram::Heartbeat {
            n: "node-a".into(),
            ip: "10.0.0.1".into(),
            port: 8420,
            st: NodeState::Active,
            rs: RenderState::Idle,
            job: None,
            chunk: None,
            pri: 100,
        };
        let json = serde_json::to_value(&datagram).unwrap();
        assert!(json.get("job").is_none());
        assert!(json.get("chunk").is_none());
    }

    #[test]
    fn goodbye_round_trips() {
        let parsed: Datagram = serde_json::from_str(r#"{"t":"bye","n":"node-b"}"#).unwrap();
        match parsed {
            Datagram::Goodbye { n } => assert_eq!(n, "node-b"),
            other => panic!("unexpected datagram: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_routes_into_registry() {
        let registry = PeerRegistry::new("local", Vec::new());
        let datagram: Datagram = serde_json::from_str(
            r#"{"t":"hb","n":"node-b","ip":"10.0.0.2","port":8420,
                "st":"active","rs":"idle","pri":70}"#,
        )
        .unwrap();
        handle_datagram(&registry, datagram);

        let peer = registry.get("node-b").unwrap();
        assert_eq!(peer.endpoint, "10.0.0.2:8420");
        assert_eq!(peer.priority, 70);
        assert!(peer.has_udp_contact);
    }

    #[test]
    fn own_datagrams_are_ignored() {
        let registry = PeerRegistry::new("local", Vec::new());
        handle_datagram(
            &registry,
            Datagram::Goodbye {
                n: "local".into(),
            },
        );
        assert!(registry.snapshot().is_empty());
    }
}
