//! The registry owns the set of known peers and derives leadership from it.
//!
//! Discovery workers produce tagged [`PeerUpdate`] messages; the registry is
//! the single place they are applied. Readers (HTTP handlers, dispatcher,
//! UI) take snapshot copies and never hold the lock across I/O.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::info::{NodeState, PeerInfo, RenderState};

/// HTTP poll failures before a peer is considered dead.
pub const MAX_FAILED_POLLS: u32 = 3;

/// UDP contact expires after this much datagram silence.
pub const UDP_CONTACT_TTL_MS: i64 = 15_000;

/// Peers with UDP contact are HTTP-polled at most this often.
pub const UDP_POLL_SKIP_MS: i64 = 9_000;

/// A state change fed into the registry by one of the discovery sources.
#[derive(Debug, Clone)]
pub enum PeerUpdate {
    /// Endpoint descriptor found on the shared filesystem.
    Discovered { node_id: String, endpoint: String },
    /// Successful `GET /api/status` poll.
    HttpStatus {
        node_id: String,
        info: PeerInfo,
        now_ms: i64,
    },
    /// Failed `GET /api/status` poll.
    HttpPollFailed { node_id: String },
    /// Heartbeat datagram on the multicast fast path.
    UdpHeartbeat {
        node_id: String,
        endpoint: String,
        node_state: NodeState,
        render_state: RenderState,
        active_job: String,
        active_chunk: String,
        priority: i32,
        now_ms: i64,
    },
    /// Farewell datagram from a cleanly stopping peer.
    UdpGoodbye { node_id: String },
}

struct Inner {
    /// node_id → peer, excluding self.
    peers: BTreeMap<String, PeerInfo>,
    leader_id: Option<String>,
    /// Static descriptor of the local node (identity, hardware, endpoint).
    local_base: PeerInfo,
    node_state: NodeState,
    render_state: RenderState,
    active_job: String,
    active_chunk: String,
}

pub struct PeerRegistry {
    node_id: String,
    tags: Vec<String>,
    inner: Mutex<Inner>,
    is_leader: AtomicBool,
}

impl PeerRegistry {
    pub fn new(node_id: impl Into<String>, tags: Vec<String>) -> Self {
        let node_id = node_id.into();
        let mut local_base = PeerInfo::minimal(node_id.clone(), "");
        local_base.tags = tags.clone();
        local_base.is_local = true;
        Self {
            node_id,
            tags,
            inner: Mutex::new(Inner {
                peers: BTreeMap::new(),
                leader_id: None,
                local_base,
                node_state: NodeState::Active,
                render_state: RenderState::Idle,
                active_job: String::new(),
                active_chunk: String::new(),
            }),
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_tags(&self) -> &[String] {
        &self.tags
    }

    /// Install the static local descriptor (hostname, hardware, endpoint).
    /// Identity fields are forced to this registry's own.
    pub fn set_local_descriptor(&self, mut info: PeerInfo) {
        info.node_id = self.node_id.clone();
        info.tags = self.tags.clone();
        info.is_local = true;
        info.is_alive = true;
        let mut inner = self.lock();
        inner.local_base = info;
    }

    /// The local node's full peer status, merging the static descriptor with
    /// live node/render state. This is what `GET /api/status` returns.
    pub fn local_peer_info(&self) -> PeerInfo {
        let inner = self.lock();
        let mut info = inner.local_base.clone();
        info.node_state = inner.node_state;
        info.render_state = inner.render_state;
        info.active_job = inner.active_job.clone();
        info.active_chunk = inner.active_chunk.clone();
        info.is_local = true;
        info.is_alive = true;
        info.is_leader = self.is_leader.load(Ordering::SeqCst);
        info
    }

    pub fn set_local_node_state(&self, state: NodeState) {
        self.lock().node_state = state;
    }

    pub fn local_node_state(&self) -> NodeState {
        self.lock().node_state
    }

    pub fn set_local_render_state(&self, state: RenderState, job: &str, chunk: &str) {
        let mut inner = self.lock();
        inner.render_state = state;
        inner.active_job = job.to_string();
        inner.active_chunk = chunk.to_string();
    }

    pub fn local_render_state(&self) -> (RenderState, String, String) {
        let inner = self.lock();
        (
            inner.render_state,
            inner.active_job.clone(),
            inner.active_chunk.clone(),
        )
    }

    /// Optimistic local override after remotely toggling a peer, so the
    /// change shows before the next poll confirms it.
    pub fn set_peer_node_state(&self, node_id: &str, state: NodeState) {
        let mut inner = self.lock();
        if let Some(peer) = inner.peers.get_mut(node_id) {
            peer.node_state = state;
        }
    }

    /// Apply one discovery-source update. This is the registry's only
    /// mutation path for peer entries.
    pub fn apply(&self, update: PeerUpdate) {
        let mut inner = self.lock();
        match update {
            PeerUpdate::Discovered { node_id, endpoint } => {
                if node_id == self.node_id || inner.peers.contains_key(&node_id) {
                    return;
                }
                tracing::info!(node_id = %node_id, endpoint = %endpoint, "discovered peer");
                inner
                    .peers
                    .insert(node_id.clone(), PeerInfo::minimal(node_id, endpoint));
            }
            PeerUpdate::HttpStatus {
                node_id,
                mut info,
                now_ms,
            } => {
                let Some(existing) = inner.peers.get_mut(&node_id) else {
                    return;
                };
                info.node_id = node_id;
                info.is_local = false;
                info.is_alive = true;
                info.is_leader = existing.is_leader;
                info.failed_polls = 0;
                info.last_seen_ms = now_ms;
                info.has_udp_contact = existing.has_udp_contact;
                info.last_udp_contact_ms = existing.last_udp_contact_ms;
                *existing = info;
            }
            PeerUpdate::HttpPollFailed { node_id } => {
                let Some(peer) = inner.peers.get_mut(&node_id) else {
                    return;
                };
                peer.failed_polls += 1;
                if peer.failed_polls >= MAX_FAILED_POLLS && peer.is_alive {
                    peer.is_alive = false;
                    tracing::warn!(
                        node_id = %node_id,
                        failed_polls = peer.failed_polls,
                        "peer is dead"
                    );
                }
            }
            PeerUpdate::UdpHeartbeat {
                node_id,
                endpoint,
                node_state,
                render_state,
                active_job,
                active_chunk,
                priority,
                now_ms,
            } => {
                if node_id == self.node_id {
                    return;
                }
                let entry = inner
                    .peers
                    .entry(node_id.clone())
                    .or_insert_with(|| {
                        tracing::info!(node_id = %node_id, endpoint = %endpoint, "discovered peer via udp");
                        PeerInfo::minimal(node_id.clone(), endpoint.clone())
                    });
                entry.node_state = node_state;
                entry.render_state = render_state;
                entry.active_job = active_job;
                entry.active_chunk = active_chunk;
                entry.priority = priority;
                entry.is_alive = true;
                entry.failed_polls = 0;
                entry.has_udp_contact = true;
                entry.last_udp_contact_ms = now_ms;
                if !endpoint.is_empty() && entry.endpoint != endpoint {
                    entry.endpoint = endpoint;
                }
            }
            PeerUpdate::UdpGoodbye { node_id } => {
                if let Some(peer) = inner.peers.get_mut(&node_id) {
                    peer.is_alive = false;
                    peer.has_udp_contact = false;
                    tracing::info!(node_id = %node_id, "peer said goodbye");
                }
            }
        }
    }

    /// Snapshot copy of all known peers (excluding self).
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.lock().peers.values().cloned().collect()
    }

    pub fn get(&self, node_id: &str) -> Option<PeerInfo> {
        self.lock().peers.get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.lock().peers.contains_key(node_id)
    }

    /// Clear UDP contact on peers that have been silent past the TTL.
    pub fn expire_udp_contact(&self, now_ms: i64) {
        let mut inner = self.lock();
        for (node_id, peer) in inner.peers.iter_mut() {
            if peer.has_udp_contact && now_ms - peer.last_udp_contact_ms > UDP_CONTACT_TTL_MS {
                peer.has_udp_contact = false;
                tracing::debug!(node_id = %node_id, "udp contact lost");
            }
        }
    }

    /// Peers due for an HTTP poll this tick. Peers with fresh UDP contact
    /// and at least one prior successful poll are probed less often.
    pub fn poll_candidates(&self, now_ms: i64) -> Vec<(String, String)> {
        self.lock()
            .peers
            .iter()
            .filter(|(_, peer)| {
                !(peer.has_udp_contact
                    && peer.last_seen_ms > 0
                    && now_ms - peer.last_seen_ms < UDP_POLL_SKIP_MS)
            })
            .map(|(id, peer)| (id.clone(), peer.endpoint.clone()))
            .collect()
    }

    /// Drop peers that are dead AND whose endpoint descriptor is gone from
    /// the shared filesystem.
    pub fn purge_dead<F: Fn(&str) -> bool>(&self, endpoint_exists: F) {
        let mut inner = self.lock();
        inner.peers.retain(|node_id, peer| {
            if !peer.is_alive && !endpoint_exists(node_id) {
                tracing::info!(node_id = %node_id, "purged stale peer");
                false
            } else {
                true
            }
        });
    }

    /// Deterministic leader election over self + alive peers. Rank:
    /// "leader"-tagged first, "noleader"-tagged last, then node id. Every
    /// node evaluating the same candidate set arrives at the same winner.
    pub fn recompute_leader(&self) -> bool {
        let mut inner = self.lock();

        let mut candidates: Vec<(bool, bool, String)> = vec![(
            !self.tags.iter().any(|t| t == "leader"),
            self.tags.iter().any(|t| t == "noleader"),
            self.node_id.clone(),
        )];
        for (id, peer) in inner.peers.iter() {
            if peer.is_alive {
                candidates.push((
                    !peer.tags.iter().any(|t| t == "leader"),
                    peer.tags.iter().any(|t| t == "noleader"),
                    id.clone(),
                ));
            }
        }

        candidates.sort();
        let new_leader = candidates[0].2.clone();
        let local_is_leader = new_leader == self.node_id;

        if inner.leader_id.as_deref() != Some(new_leader.as_str()) {
            tracing::info!(
                leader = %new_leader,
                local = local_is_leader,
                "leader elected"
            );
            inner.leader_id = Some(new_leader.clone());
        }

        for (id, peer) in inner.peers.iter_mut() {
            peer.is_leader = *id == new_leader;
        }
        self.is_leader.store(local_is_leader, Ordering::SeqCst);
        local_is_leader
    }

    pub fn is_local_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn leader_id(&self) -> Option<String> {
        self.lock().leader_id.clone()
    }

    /// The elected leader's mesh endpoint: a peer's endpoint when a peer
    /// leads, our own when we do.
    pub fn leader_endpoint(&self) -> Option<String> {
        let inner = self.lock();
        for peer in inner.peers.values() {
            if peer.is_leader && peer.is_alive {
                return Some(peer.endpoint.clone());
            }
        }
        if self.is_leader.load(Ordering::SeqCst) {
            return Some(inner.local_base.endpoint.clone());
        }
        None
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
