//! LAN Media Mesh
//!
//! Full-mesh peer-to-peer node exchanging text, video and audio with every
//! paired peer.
//!
//! ## Channel layout
//!
//! ```text
//! base + 0   text    broadcast  (publisher / subscriber)
//! base + 1   video   fan-out    (publisher / subscriber)
//! base + 2   control request/reply (CONNECT / OK)
//! base + 3   audio   fan-out    (publisher / subscriber)
//! ```
//!
//! ## Data flow
//!
//! ```text
//! capture ──> publisher ──> peer subscriber ──> receive loop ──> ingress buffer ──> display / playback
//!                 ▲
//!           peer registry (gates fan-out, filled by the handshake)
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod media;
pub mod network;
pub mod node;
pub mod peers;
pub mod protocol;
pub mod worker;

pub use error::{Error, Result};
pub use node::{Collaborators, MeshNode};
pub use peers::{PeerEndpoint, PeerRegistry};

/// Crate-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default base port
    pub const DEFAULT_BASE_PORT: u16 = 5000;

    /// Text broadcast offset from the base port
    pub const TEXT_PORT_OFFSET: u16 = 0;

    /// Video fan-out offset from the base port
    pub const VIDEO_PORT_OFFSET: u16 = 1;

    /// Control request/reply offset from the base port
    pub const CONTROL_PORT_OFFSET: u16 = 2;

    /// Audio fan-out offset from the base port
    pub const AUDIO_PORT_OFFSET: u16 = 3;

    /// Highest offset in use; base ports above `u16::MAX - MAX_PORT_OFFSET` are invalid
    pub const MAX_PORT_OFFSET: u16 = AUDIO_PORT_OFFSET;

    /// Default ingress buffer capacity (units) for both media kinds
    pub const DEFAULT_INGRESS_CAPACITY: usize = 10;

    /// Default outbound queue depth per downstream link
    pub const DEFAULT_SEND_QUEUE_DEPTH: usize = 32;

    /// Default inbound queue depth per subscriber
    pub const DEFAULT_RECV_QUEUE_DEPTH: usize = 256;

    /// Default audio sample rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

    /// Default audio channel count
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default samples per channel in one audio block
    pub const DEFAULT_AUDIO_BLOCK_SIZE: usize = 1024;

    /// Bytes per sample (f32)
    pub const BYTES_PER_SAMPLE: usize = 4;

    /// Default video frame geometry
    pub const DEFAULT_FRAME_WIDTH: u16 = 320;
    pub const DEFAULT_FRAME_HEIGHT: u16 = 240;
    pub const DEFAULT_FRAME_RATE: u32 = 15;

    /// Maximum frame size on any channel
    pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

    /// Control poll timeout
    pub const CONTROL_POLL_TIMEOUT: Duration = Duration::from_millis(100);

    /// Idle sleep between empty receive polls
    pub const DEFAULT_RECEIVE_IDLE: Duration = Duration::from_millis(10);

    /// Handshake reply timeout
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

    /// Subscriber reconnect interval
    pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

    /// Bounded join timeout per worker thread at shutdown
    pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
}
