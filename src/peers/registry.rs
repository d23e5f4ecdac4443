//! Peer registry
//!
//! Concurrency-safe set of remote endpoints with a per-endpoint state
//! machine `Unknown → Connecting → Connected`. There is no departure state:
//! a connected peer stays until the process exits.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Instant;
use tokio::sync::broadcast;

use crate::error::PairingError;
use crate::peers::PeerEndpoint;

/// Events emitted by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connecting(PeerEndpoint),
    Connected(PeerEndpoint),
    /// Handshake abandoned: (peer, reason)
    Failed(PeerEndpoint, String),
}

/// Per-endpoint pairing state; absence means `Unknown`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting { since: Instant },
    Connected { since: Instant },
}

/// Registry of paired peers
pub struct PeerRegistry {
    peers: DashMap<PeerEndpoint, PeerState>,

    /// Event broadcaster
    event_tx: broadcast::Sender<PeerEvent>,

    /// Event receiver (for cloning)
    _event_rx: broadcast::Receiver<PeerEvent>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (event_tx, event_rx) = broadcast::channel(64);

        Self {
            peers: DashMap::new(),
            event_tx,
            _event_rx: event_rx,
        }
    }

    /// Subscribe to peer events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.event_tx.subscribe()
    }

    /// Claim an unknown endpoint for a handshake.
    ///
    /// Fails without side effects if the endpoint is already connecting or connected.
    pub fn begin_connecting(&self, peer: PeerEndpoint) -> Result<(), PairingError> {
        match self.peers.entry(peer) {
            Entry::Occupied(_) => Err(PairingError::AlreadyPaired(peer.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(PeerState::Connecting {
                    since: Instant::now(),
                });
                let _ = self.event_tx.send(PeerEvent::Connecting(peer));
                Ok(())
            }
        }
    }

    /// Promote a claimed endpoint to connected
    pub fn mark_connected(&self, peer: PeerEndpoint) {
        self.peers.insert(
            peer,
            PeerState::Connected {
                since: Instant::now(),
            },
        );
        let _ = self.event_tx.send(PeerEvent::Connected(peer));
    }

    /// Release a claim after a failed handshake; connected entries are untouched
    pub fn abandon(&self, peer: PeerEndpoint, reason: &str) {
        let removed = self
            .peers
            .remove_if(&peer, |_, state| matches!(state, PeerState::Connecting { .. }))
            .is_some();

        if removed {
            let _ = self
                .event_tx
                .send(PeerEvent::Failed(peer, reason.to_string()));
        }
    }

    /// Register an endpoint as connected without a handshake.
    ///
    /// Returns false if it was already known.
    pub fn insert_connected(&self, peer: PeerEndpoint) -> bool {
        match self.peers.entry(peer) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(PeerState::Connected {
                    since: Instant::now(),
                });
                let _ = self.event_tx.send(PeerEvent::Connected(peer));
                true
            }
        }
    }

    pub fn state(&self, peer: &PeerEndpoint) -> Option<PeerState> {
        self.peers.get(peer).map(|entry| *entry.value())
    }

    pub fn is_connected(&self, peer: &PeerEndpoint) -> bool {
        matches!(self.state(peer), Some(PeerState::Connected { .. }))
    }

    /// Snapshot of connected peers, sorted.
    ///
    /// Safe to take while other threads add peers; the fan-out loops iterate this copy.
    pub fn connected(&self) -> Vec<PeerEndpoint> {
        let mut peers: Vec<PeerEndpoint> = self
            .peers
            .iter()
            .filter(|entry| matches!(entry.value(), PeerState::Connected { .. }))
            .map(|entry| *entry.key())
            .collect();
        peers.sort();
        peers
    }

    /// Number of connected peers
    pub fn len(&self) -> usize {
        self.peers
            .iter()
            .filter(|entry| matches!(entry.value(), PeerState::Connected { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::thread;

    fn peer(port: u16) -> PeerEndpoint {
        PeerEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_state_machine() {
        let registry = PeerRegistry::new();
        let b = peer(6000);

        assert_eq!(registry.state(&b), None);
        registry.begin_connecting(b).unwrap();
        assert!(matches!(registry.state(&b), Some(PeerState::Connecting { .. })));
        assert!(registry.connected().is_empty());

        registry.mark_connected(b);
        assert!(registry.is_connected(&b));
        assert_eq!(registry.connected(), vec![b]);
    }

    #[test]
    fn test_duplicate_claims_rejected() {
        let registry = PeerRegistry::new();
        let b = peer(6000);

        registry.begin_connecting(b).unwrap();
        assert!(matches!(
            registry.begin_connecting(b),
            Err(PairingError::AlreadyPaired(_))
        ));

        registry.mark_connected(b);
        for _ in 0..3 {
            assert!(registry.begin_connecting(b).is_err());
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_abandon_only_releases_pending_claims() {
        let registry = PeerRegistry::new();
        let b = peer(6000);
        let c = peer(7000);

        registry.begin_connecting(b).unwrap();
        registry.abandon(b, "timeout");
        assert_eq!(registry.state(&b), None);
        // Retrying after a failure is allowed
        registry.begin_connecting(b).unwrap();

        registry.insert_connected(c);
        registry.abandon(c, "late failure");
        assert!(registry.is_connected(&c));
    }

    #[test]
    fn test_events() {
        let registry = PeerRegistry::new();
        let mut events = registry.subscribe();
        let b = peer(6000);

        registry.begin_connecting(b).unwrap();
        registry.mark_connected(b);

        assert_eq!(events.try_recv().unwrap(), PeerEvent::Connecting(b));
        assert_eq!(events.try_recv().unwrap(), PeerEvent::Connected(b));
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let registry = Arc::new(PeerRegistry::new());
        let b = peer(6000);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.begin_connecting(b).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_snapshot_while_inserting() {
        let registry = Arc::new(PeerRegistry::new());
        let writer = {
            let registry = registry.clone();
            thread::spawn(move || {
                for port in 0..200u16 {
                    registry.insert_connected(peer(10_000 + port * 4));
                }
            })
        };

        let mut last = 0;
        while !writer.is_finished() {
            let snapshot = registry.connected();
            assert!(snapshot.len() >= last);
            last = snapshot.len();
        }
        writer.join().unwrap();
        assert_eq!(registry.len(), 200);
    }
}
