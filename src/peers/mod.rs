//! Peer identity and the registry of paired peers

pub mod endpoint;
pub mod registry;

pub use endpoint::PeerEndpoint;
pub use registry::{PeerEvent, PeerRegistry, PeerState};
