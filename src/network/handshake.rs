//! Pairing handshake
//!
//! ```text
//! Node A (initiator)                         Node B (acceptor)
//!   │ subscribe text/video/audio ─────────────>│ publishers
//!   │── CONNECT <A port> [<A addr>] ──────────>│ control
//!   │                                          │ spawn: pair back with A
//!   │<──────────────────────────────── OK ─────│
//!   │ A: Connected(B)                          │
//!   │<──────────── subscribe text/video/audio ─│
//!   │<──────── CONNECT <B port> [<B addr>] ────│
//!   │── OK ───────────────────────────────────>│ B: Connected(A)
//! ```
//!
//! The acceptor answers `OK` before its own pairing back has run, and the
//! outcome of that reciprocal attempt is only logged. A node can therefore
//! tell a peer `OK` and never finish subscribing to it.
//!
//! Both sides must agree on one identity per node, because publishers find a
//! registered peer's link by that identity. A node announces its advertised
//! address when it has one. When pairing back it otherwise announces the
//! address the initiator reached it at. With nothing announced, the other
//! side uses the connection's source address. Subscription preambles toward a
//! peer carry the same announced host as the CONNECT sent to it.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::constants::CONTROL_POLL_TIMEOUT;
use crate::error::{NetworkError, PairingError};
use crate::network::control::{request, ControlServer, PendingRequest};
use crate::network::subscriber::Subscriber;
use crate::peers::{PeerEndpoint, PeerRegistry};
use crate::protocol::ControlMessage;

/// This node's subscribers, one per enabled channel
pub struct Subscriptions {
    pub text: Arc<Subscriber>,
    pub video: Option<Arc<Subscriber>>,
    pub audio: Option<Arc<Subscriber>>,
}

impl Subscriptions {
    /// Dial the peer's publishers on every enabled channel, announcing
    /// ourselves as `host` when given
    pub fn subscribe_to(&self, peer: &PeerEndpoint, host: Option<IpAddr>) -> Result<(), NetworkError> {
        self.text.connect(peer.text_addr(), host)?;
        if let Some(video) = &self.video {
            video.connect(peer.video_addr(), host)?;
        }
        if let Some(audio) = &self.audio {
            audio.connect(peer.audio_addr(), host)?;
        }
        Ok(())
    }

    pub fn close(&self, timeout: Duration) {
        self.text.close(timeout);
        if let Some(video) = &self.video {
            video.close(timeout);
        }
        if let Some(audio) = &self.audio {
            audio.close(timeout);
        }
    }
}

/// Handshake settings
#[derive(Debug, Clone)]
pub struct PairingSettings {
    /// Announce our own address instead of letting each peer infer it
    pub advertise_address: Option<String>,

    /// Reply timeout
    pub timeout: Duration,

    /// Pair back with initiators instead of registering them directly
    pub reciprocal: bool,
}

/// Runs both sides of the pairing handshake
pub struct PairingService {
    local: PeerEndpoint,
    settings: PairingSettings,
    registry: Arc<PeerRegistry>,
    subscriptions: Arc<Subscriptions>,
    running: Arc<AtomicBool>,
}

impl PairingService {
    pub fn new(
        local: PeerEndpoint,
        settings: PairingSettings,
        registry: Arc<PeerRegistry>,
        subscriptions: Arc<Subscriptions>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            local,
            settings,
            registry,
            subscriptions,
            running,
        }
    }

    pub fn local(&self) -> PeerEndpoint {
        self.local
    }

    /// Same base port on an address that reaches this host
    pub fn is_self(&self, peer: &PeerEndpoint) -> bool {
        if peer.base_port() != self.local.base_port() {
            return false;
        }
        let host = peer.host();
        host.is_loopback() || host.is_unspecified() || host == self.local.host()
    }

    /// Pair with `peer`: subscribe to its channels, send CONNECT, wait for OK.
    ///
    /// Blocks for at most the handshake timeout. Self and duplicate attempts are
    /// rejected before anything touches the network.
    pub fn initiate(&self, peer: PeerEndpoint) -> Result<(), PairingError> {
        self.initiate_from(peer, None)
    }

    /// Host we go by at a peer: our advertised address, else the address the
    /// peer reached us at, else whatever source address it sees
    fn announced_host(&self, reached_at: Option<IpAddr>) -> Option<IpAddr> {
        if self.settings.advertise_address.is_some() {
            Some(self.local.host())
        } else {
            reached_at
        }
    }

    fn initiate_from(&self, peer: PeerEndpoint, reached_at: Option<IpAddr>) -> Result<(), PairingError> {
        if self.is_self(&peer) {
            return Err(PairingError::SelfPairing(peer.to_string()));
        }
        self.registry.begin_connecting(peer)?;

        tracing::info!("Pairing with {}", peer);

        let announced = self.announced_host(reached_at);
        if let Err(source) = self.subscriptions.subscribe_to(&peer, announced) {
            self.registry.abandon(peer, &source.to_string());
            return Err(PairingError::Transport {
                peer: peer.to_string(),
                source,
            });
        }

        let connect = ControlMessage::Connect {
            base_port: self.local.base_port(),
            address: announced.map(|host| host.to_string()),
        };

        let reply = match request(peer.control_addr(), &connect.to_string(), self.settings.timeout) {
            Ok(reply) => reply,
            Err(source) => {
                self.registry.abandon(peer, &source.to_string());
                return Err(PairingError::Transport {
                    peer: peer.to_string(),
                    source,
                });
            }
        };

        match ControlMessage::parse(&reply) {
            Ok(ControlMessage::Ok) => {
                self.registry.mark_connected(peer);
                tracing::info!("Connection established with {}", peer);
                Ok(())
            }
            _ => {
                self.registry.abandon(peer, &reply);
                Err(PairingError::Rejected {
                    peer: peer.to_string(),
                    reply,
                })
            }
        }
    }

    /// Answer one control request
    pub fn handle_request(self: &Arc<Self>, pending: PendingRequest) {
        let reply = match ControlMessage::parse(pending.message()) {
            Ok(ControlMessage::Connect { base_port, address }) => {
                match Self::initiator(address.as_deref(), base_port, pending.peer_addr()) {
                    Ok(peer) => {
                        self.accept(peer, pending.local_addr().ip());
                        ControlMessage::Ok
                    }
                    Err(e) => ControlMessage::Err(e.to_string()),
                }
            }
            Ok(other) => ControlMessage::Err(format!("unexpected request: {}", other)),
            Err(e) => ControlMessage::Err(e.to_string()),
        };

        if let ControlMessage::Err(reason) = &reply {
            tracing::debug!("Rejecting control request from {}: {}", pending.peer_addr(), reason);
        }

        if let Err(e) = pending.reply(&reply.to_string()) {
            tracing::debug!("Failed to send control reply: {}", e);
        }
    }

    fn initiator(
        address: Option<&str>,
        base_port: u16,
        source: SocketAddr,
    ) -> Result<PeerEndpoint, NetworkError> {
        match address {
            Some(address) => PeerEndpoint::resolve(address, base_port),
            None => Ok(PeerEndpoint::new(source.ip(), base_port)),
        }
    }

    /// `reached_at` is our address as the initiator dialed it
    fn accept(self: &Arc<Self>, peer: PeerEndpoint, reached_at: IpAddr) {
        if self.settings.reciprocal {
            self.spawn_reciprocal(peer, reached_at);
        } else {
            self.register_direct(peer, reached_at);
        }
    }

    /// Fire-and-forget pairing back toward the initiator
    fn spawn_reciprocal(self: &Arc<Self>, peer: PeerEndpoint, reached_at: IpAddr) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }

        let service = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("pair-back-{}", peer))
            .spawn(move || match service.initiate_from(peer, Some(reached_at)) {
                Ok(()) => {}
                Err(e) if e.is_duplicate_or_self() => {
                    tracing::debug!("Reciprocal pairing with {} skipped: {}", peer, e);
                }
                Err(e) => {
                    tracing::warn!("Reciprocal pairing with {} failed after replying OK: {}", peer, e);
                }
            });

        if let Err(e) = spawned {
            tracing::warn!("Cannot spawn reciprocal pairing with {}: {}", peer, e);
        }
    }

    /// Subscribe to the initiator and register it without a handshake of our own
    fn register_direct(&self, peer: PeerEndpoint, reached_at: IpAddr) {
        if self.is_self(&peer) {
            return;
        }
        if let Err(e) = self.subscriptions.subscribe_to(&peer, self.announced_host(Some(reached_at))) {
            tracing::warn!("Cannot subscribe to {}: {}", peer, e);
            return;
        }
        if self.registry.insert_connected(peer) {
            tracing::info!("Connection established with {}", peer);
        }
    }

    /// Control-channel server loop; returns when `running` clears
    pub fn run_control_loop(self: Arc<Self>, server: ControlServer) {
        tracing::debug!("Control channel listening on {}", server.local_addr());

        while self.running.load(Ordering::Relaxed) {
            match server.poll(CONTROL_POLL_TIMEOUT) {
                Ok(Some(pending)) => self.handle_request(pending),
                Ok(None) => {}
                Err(e) => tracing::debug!("Control channel error: {}", e),
            }
        }
    }
}

/// Own identity as announced to peers
pub fn local_endpoint(advertise_address: Option<&str>, base_port: u16) -> Result<PeerEndpoint, NetworkError> {
    match advertise_address {
        Some(address) => PeerEndpoint::resolve(address, base_port),
        None => Ok(PeerEndpoint::new(IpAddr::from([127, 0, 0, 1]), base_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    fn service(base_port: u16, reciprocal: bool) -> Arc<PairingService> {
        service_advertising(base_port, reciprocal, None)
    }

    fn service_advertising(base_port: u16, reciprocal: bool, advertise: Option<&str>) -> Arc<PairingService> {
        let config = NetworkConfig {
            bind_address: "127.0.0.1".to_string(),
            ..Default::default()
        };
        let subscriptions = Arc::new(Subscriptions {
            text: Arc::new(Subscriber::new("text", base_port, &config)),
            video: None,
            audio: None,
        });
        Arc::new(PairingService::new(
            local_endpoint(advertise, base_port).unwrap(),
            PairingSettings {
                advertise_address: advertise.map(str::to_string),
                timeout: Duration::from_millis(300),
                reciprocal,
            },
            Arc::new(PeerRegistry::new()),
            subscriptions,
            Arc::new(AtomicBool::new(true)),
        ))
    }

    #[test]
    fn test_self_pairing_rejected_without_side_effects() {
        let svc = service(5000, true);
        for host in ["127.0.0.1", "localhost", "0.0.0.0"] {
            let me = PeerEndpoint::resolve(host, 5000).unwrap();
            assert!(matches!(svc.initiate(me), Err(PairingError::SelfPairing(_))));
        }
        assert!(svc.registry.is_empty());
        assert_eq!(svc.subscriptions.text.stats().endpoints, 0);
    }

    #[test]
    fn test_same_port_on_other_host_is_not_self() {
        let svc = service(5000, true);
        assert!(!svc.is_self(&PeerEndpoint::resolve("10.1.2.3", 5000).unwrap()));
        assert!(!svc.is_self(&PeerEndpoint::resolve("127.0.0.1", 5001).unwrap()));
    }

    #[test]
    fn test_unreachable_peer_fails_and_leaves_registry_unknown() {
        let svc = service(5000, true);
        // Port 1 on loopback: nothing listens on the control port (3)
        let peer = PeerEndpoint::resolve("127.0.0.1", 1).unwrap();
        let err = svc.initiate(peer).unwrap_err();
        assert!(matches!(err, PairingError::Transport { .. }));
        assert!(svc.registry.state(&peer).is_none());
        svc.subscriptions.close(Duration::from_secs(1));
    }

    #[test]
    fn test_duplicate_pairing_is_idempotent_noop() {
        let svc = service(5000, true);
        let peer = PeerEndpoint::resolve("127.0.0.1", 6000).unwrap();
        svc.registry.insert_connected(peer);

        for _ in 0..3 {
            let err = svc.initiate(peer).unwrap_err();
            assert!(err.is_duplicate_or_self());
        }
        assert_eq!(svc.registry.connected(), vec![peer]);
        assert_eq!(svc.subscriptions.text.stats().endpoints, 0);
    }

    #[test]
    fn test_initiator_address_fallback() {
        let source: SocketAddr = "192.168.1.9:40000".parse().unwrap();
        let from_source = PairingService::initiator(None, 6000, source).unwrap();
        assert_eq!(from_source.to_string(), "192.168.1.9:6000");

        let announced = PairingService::initiator(Some("10.0.0.4"), 6000, source).unwrap();
        assert_eq!(announced.to_string(), "10.0.0.4:6000");
    }

    #[test]
    fn test_announced_host_prefers_advertised_address() {
        let reached_at: IpAddr = "127.0.0.2".parse().unwrap();

        let plain = service(5000, true);
        assert_eq!(plain.announced_host(None), None);
        assert_eq!(plain.announced_host(Some(reached_at)), Some(reached_at));

        let advertising = service_advertising(5000, true, Some("10.0.0.4"));
        let advertised: IpAddr = "10.0.0.4".parse().unwrap();
        assert_eq!(advertising.announced_host(None), Some(advertised));
        assert_eq!(advertising.announced_host(Some(reached_at)), Some(advertised));
    }

    #[test]
    fn test_direct_acceptor_registers_initiator_under_announced_host() {
        let acceptor = service(5000, false);
        let server = ControlServer::bind(
            &NetworkConfig {
                bind_address: "127.0.0.1".to_string(),
                ..Default::default()
            },
            0,
        )
        .unwrap();
        let addr = server.local_addr();

        let client = thread::spawn(move || request(addr, "CONNECT 6000 127.0.0.5", Duration::from_secs(5)));
        let pending = loop {
            if let Some(pending) = server.poll(Duration::from_millis(100)).unwrap() {
                break pending;
            }
        };
        acceptor.handle_request(pending);

        assert_eq!(client.join().unwrap().unwrap(), "OK");
        let initiator = PeerEndpoint::resolve("127.0.0.5", 6000).unwrap();
        assert_eq!(acceptor.registry.connected(), vec![initiator]);
        assert!(acceptor.subscriptions.text.is_dialed(&initiator.text_addr()));
        acceptor.subscriptions.close(Duration::from_secs(1));
    }
}
