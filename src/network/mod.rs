//! Network subsystem
//!
//! Each node exposes four TCP ports at fixed offsets from its base port:
//! - text (+0), video (+1) and audio (+3): publish/subscribe data channels
//! - control (+2): request/reply pairing handshake
//!
//! Data travels as length-prefixed frames (see [`framing`]).

pub mod control;
pub mod framing;
pub mod handshake;
pub mod publisher;
pub mod socket;
pub mod subscriber;

pub use control::{request, ControlServer, PendingRequest};
pub use handshake::{PairingService, PairingSettings, Subscriptions};
pub use publisher::{Publisher, PublisherStats};
pub use subscriber::{Subscriber, SubscriberStats};
