//! Error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

/// Transport-level errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Failed to bind {0}")]
    BindFailed(String),

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Failed to send: {0}")]
    SendFailed(String),

    #[error("Failed to receive: {0}")]
    ReceiveFailed(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Address resolution failed: {0}")]
    Resolve(String),
}

/// Handshake outcomes other than success
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("Refusing to pair with self ({0})")]
    SelfPairing(String),

    #[error("Already paired or pairing with {0}")]
    AlreadyPaired(String),

    #[error("Peer {peer} rejected the handshake: {reply}")]
    Rejected { peer: String, reply: String },

    #[error("Handshake with {peer} failed: {source}")]
    Transport {
        peer: String,
        #[source]
        source: NetworkError,
    },
}

impl PairingError {
    /// Rejected synchronously, no side effects
    pub fn is_duplicate_or_self(&self) -> bool {
        matches!(self, Self::SelfPairing(_) | Self::AlreadyPaired(_))
    }
}

/// Malformed wire data
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Unexpected argument: {0}")]
    UnexpectedArgument(String),

    #[error("Packet too short: {0} bytes")]
    TooShort(usize),

    #[error("Bad magic: {0:#06x}")]
    BadMagic(u16),

    #[error("Unknown media kind: {0}")]
    UnknownKind(u8),
}

/// Capture/codec/playback errors
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("{0}")]
    Other(String),
}
