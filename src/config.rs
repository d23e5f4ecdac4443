//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Network configuration
    pub network: NetworkConfig,

    /// Media configuration
    pub media: MediaConfig,

    /// Pairing behaviour
    pub pairing: PairingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local bind address for all four channels
    pub bind_address: String,

    /// Base port; channel ports are fixed offsets from it
    pub base_port: u16,

    /// Address announced to peers in CONNECT requests. When unset, peers
    /// answer to the source address of the request.
    pub advertise_address: Option<String>,

    /// Socket send buffer size
    pub send_buffer_size: usize,

    /// Socket receive buffer size
    pub recv_buffer_size: usize,

    /// Enable SO_REUSEADDR
    pub reuse_addr: bool,

    /// Outbound queue depth per downstream link
    pub send_queue_depth: usize,

    /// Inbound queue depth per subscriber
    pub recv_queue_depth: usize,

    /// Handshake reply timeout in ms
    pub handshake_timeout_ms: u64,

    /// Subscriber reconnect interval in ms
    pub reconnect_interval_ms: u64,

    /// Idle sleep between empty receive polls in ms
    pub receive_idle_ms: u64,

    /// Per-thread join timeout at shutdown in ms
    pub join_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            base_port: DEFAULT_BASE_PORT,
            advertise_address: None,
            send_buffer_size: 1024 * 1024,
            recv_buffer_size: 1024 * 1024,
            reuse_addr: true,
            send_queue_depth: DEFAULT_SEND_QUEUE_DEPTH,
            recv_queue_depth: DEFAULT_RECV_QUEUE_DEPTH,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL.as_millis() as u64,
            receive_idle_ms: DEFAULT_RECEIVE_IDLE.as_millis() as u64,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl NetworkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn receive_idle(&self) -> Duration {
        Duration::from_millis(self.receive_idle_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Media configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Capture, publish and subscribe video
    pub video_enabled: bool,

    /// Capture, publish and subscribe audio (binds base + 3)
    pub audio_enabled: bool,

    /// Video ingress buffer capacity in frames
    pub video_buffer_capacity: usize,

    /// Audio ingress buffer capacity in blocks
    pub audio_buffer_capacity: usize,

    /// Audio sample rate
    pub sample_rate: u32,

    /// Audio channel count
    pub channels: u16,

    /// Samples per channel in one audio block
    pub audio_block_size: usize,

    /// Captured frame width
    pub frame_width: u16,

    /// Captured frame height
    pub frame_height: u16,

    /// Capture frame rate
    pub frame_rate: u32,

    /// Display refresh interval in ms
    pub display_interval_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_enabled: true,
            audio_enabled: true,
            video_buffer_capacity: DEFAULT_INGRESS_CAPACITY,
            audio_buffer_capacity: DEFAULT_INGRESS_CAPACITY,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            audio_block_size: DEFAULT_AUDIO_BLOCK_SIZE,
            frame_width: DEFAULT_FRAME_WIDTH,
            frame_height: DEFAULT_FRAME_HEIGHT,
            frame_rate: DEFAULT_FRAME_RATE,
            display_interval_ms: 15,
        }
    }
}

impl MediaConfig {
    /// Size in bytes of one audio block (f32 samples)
    pub fn audio_block_bytes(&self) -> usize {
        self.audio_block_size * self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Duration of one audio block; the playback callback period
    pub fn audio_block_period(&self) -> Duration {
        let rate = self.sample_rate.max(1) as u64;
        Duration::from_micros(self.audio_block_size as u64 * 1_000_000 / rate)
    }

    /// Interval between captured frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.frame_rate.max(1) as u64)
    }

    pub fn display_interval(&self) -> Duration {
        Duration::from_millis(self.display_interval_ms)
    }
}

/// Pairing behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// On an inbound CONNECT, run a full handshake back toward the initiator.
    /// When false the acceptor subscribes back and registers the initiator directly.
    pub reciprocal: bool,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self { reciprocal: true }
    }
}

impl NodeConfig {
    /// Load configuration from file
    pub fn load(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &PathBuf) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "media-mesh", "lan-media-mesh")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject values the node cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        let port = self.network.base_port;
        if port == 0 || port > u16::MAX - MAX_PORT_OFFSET {
            return Err(crate::Error::Config(format!(
                "base port {} leaves no room for {} channel ports",
                port,
                MAX_PORT_OFFSET + 1
            )));
        }
        if self.media.video_buffer_capacity == 0 || self.media.audio_buffer_capacity == 0 {
            return Err(crate::Error::Config("ingress buffer capacity must be non-zero".into()));
        }
        if self.network.send_queue_depth == 0 || self.network.recv_queue_depth == 0 {
            return Err(crate::Error::Config("queue depths must be non-zero".into()));
        }
        if self.media.audio_block_size == 0 || self.media.channels == 0 {
            return Err(crate::Error::Config("audio block must contain samples".into()));
        }
        Ok(())
    }
}
