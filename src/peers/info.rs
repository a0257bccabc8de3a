use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Active,
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Active => f.write_str("active"),
            NodeState::Stopped => f.write_str("stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderState {
    #[default]
    Idle,
    Rendering,
}

impl std::fmt::Display for RenderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderState::Idle => f.write_str("idle"),
            RenderState::Rendering => f.write_str("rendering"),
        }
    }
}

/// Written to `<farm>/nodes/<node_id>/endpoint.json` for filesystem-based
/// peer discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub node_id: String,
    pub ip: String,
    pub port: u16,
    pub timestamp_ms: i64,
}

/// Full peer status, returned by `GET /api/status`. Runtime fields are
/// computed locally by the registry and never cross the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerInfo {
    pub node_id: String,
    pub hostname: String,
    pub os: String,
    pub app_version: String,

    pub gpu_name: String,
    pub cpu_cores: u32,
    pub ram_mb: u64,

    pub node_state: NodeState,
    pub render_state: RenderState,
    pub active_job: String,
    pub active_chunk: String,
    pub priority: i32,
    pub tags: Vec<String>,

    /// "ip:port" of the peer's mesh API.
    pub endpoint: String,

    #[serde(skip)]
    pub is_local: bool,
    #[serde(skip)]
    pub is_alive: bool,
    #[serde(skip)]
    pub is_leader: bool,
    #[serde(skip)]
    pub failed_polls: u32,
    #[serde(skip)]
    pub last_seen_ms: i64,
    #[serde(skip)]
    pub has_udp_contact: bool,
    #[serde(skip)]
    pub last_udp_contact_ms: i64,
}

impl Default for PeerInfo {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            hostname: String::new(),
            os: String::new(),
            app_version: String::new(),
            gpu_name: String::new(),
            cpu_cores: 0,
            ram_mb: 0,
            node_state: NodeState::Active,
            render_state: RenderState::Idle,
            active_job: String::new(),
            active_chunk: String::new(),
            priority: 100,
            tags: Vec::new(),
            endpoint: String::new(),
            is_local: false,
            is_alive: true,
            is_leader: false,
            failed_polls: 0,
            last_seen_ms: 0,
            has_udp_contact: false,
            last_udp_contact_ms: 0,
        }
    }
}

impl PeerInfo {
    /// Minimal entry for a peer known only by its endpoint descriptor.
    /// `last_seen_ms` stays 0 until the first successful HTTP poll fills in
    /// the rest.
    pub fn minimal(node_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }
}

/// Parse "host:port" into its parts.
pub fn parse_endpoint(endpoint: &str) -> Option<(String, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

/// Best-effort detection of the primary outbound IPv4 address. Connecting a
/// UDP socket sends no packets; it only asks the kernel for a route.
pub fn detect_local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
