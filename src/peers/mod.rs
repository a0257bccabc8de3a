pub mod discovery;
pub mod info;
pub mod multicast;
pub mod registry;

pub use discovery::DiscoveryPlane;
pub use info::{detect_local_ip, parse_endpoint, NodeState, PeerEndpoint, PeerInfo, RenderState};
pub use registry::{PeerRegistry, PeerUpdate};
