//! Subscribing side of a data channel
//!
//! A [`Subscriber`] dials any number of remote publishers and merges every
//! frame they send into one bounded inbound queue. Each dialed endpoint has
//! its own thread that reconnects until the subscriber is closed, so data
//! resumes on its own once an unreachable peer comes up.
//!
//! Every connection opens with a subscription preamble naming this node's base
//! port and, per endpoint, the host it is known by at that peer.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashSet;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::framing::{write_frame, FrameDecoder, ReadStatus};
use crate::network::socket::connect;
use crate::protocol::subscription_preamble;
use crate::worker::{join_all, Worker};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const READ_TIMEOUT: Duration = Duration::from_millis(100);

struct Shared {
    channel: &'static str,
    running: AtomicBool,
    base_port: u16,
    reconnect_interval: Duration,
    inbound_tx: Sender<Bytes>,
    units_received: AtomicU64,
    units_dropped: AtomicU64,
}

/// Subscriber for one channel kind
pub struct Subscriber {
    shared: Arc<Shared>,
    inbound_rx: Receiver<Bytes>,
    dialed: DashSet<SocketAddr>,
    workers: Mutex<Vec<Worker>>,
}

impl Subscriber {
    /// Create a subscriber that identifies itself to publishers with `base_port`
    pub fn new(channel: &'static str, base_port: u16, config: &NetworkConfig) -> Self {
        let (inbound_tx, inbound_rx) = bounded::<Bytes>(config.recv_queue_depth.max(1));

        Self {
            shared: Arc::new(Shared {
                channel,
                running: AtomicBool::new(true),
                base_port,
                reconnect_interval: config.reconnect_interval(),
                inbound_tx,
                units_received: AtomicU64::new(0),
                units_dropped: AtomicU64::new(0),
            }),
            inbound_rx,
            dialed: DashSet::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start receiving from `addr`, announcing ourselves as `host` when given.
    /// Connecting twice to the same address is a no-op.
    pub fn connect(&self, addr: SocketAddr, host: Option<IpAddr>) -> Result<bool, NetworkError> {
        if !self.shared.running.load(Ordering::Relaxed) {
            return Err(NetworkError::Closed);
        }
        if !self.dialed.insert(addr) {
            return Ok(false);
        }

        let shared = self.shared.clone();
        let preamble = subscription_preamble(self.shared.base_port, host);
        let worker = Worker::spawn(format!("{}-sub-{}", self.shared.channel, addr), move || {
            Self::dial_loop(addr, preamble, shared);
        })
        .map_err(|e| {
            self.dialed.remove(&addr);
            NetworkError::ConnectFailed(e.to_string())
        })?;

        self.workers.lock().push(worker);
        Ok(true)
    }

    fn dial_loop(addr: SocketAddr, preamble: Bytes, shared: Arc<Shared>) {
        let mut announced = false;

        while shared.running.load(Ordering::Relaxed) {
            let mut stream = match connect(addr, CONNECT_TIMEOUT) {
                Ok(stream) => stream,
                Err(e) => {
                    if !announced {
                        tracing::debug!("{}: {} not reachable yet: {}", shared.channel, addr, e);
                        announced = true;
                    }
                    thread::sleep(shared.reconnect_interval);
                    continue;
                }
            };

            let _ = stream.set_read_timeout(Some(READ_TIMEOUT));
            if let Err(e) = write_frame(&mut stream, &preamble) {
                tracing::debug!("{}: subscribe to {} failed: {}", shared.channel, addr, e);
                thread::sleep(shared.reconnect_interval);
                continue;
            }

            tracing::debug!("{}: subscribed to {}", shared.channel, addr);
            announced = false;

            let mut decoder = FrameDecoder::new();
            while shared.running.load(Ordering::Relaxed) {
                match decoder.read_frame(&mut stream) {
                    Ok(ReadStatus::Frame(frame)) => {
                        shared.units_received.fetch_add(1, Ordering::Relaxed);
                        if shared.inbound_tx.try_send(frame).is_err() {
                            shared.units_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(ReadStatus::Idle) => {}
                    Err(e) => {
                        tracing::debug!("{}: link to {} lost: {}", shared.channel, addr, e);
                        break;
                    }
                }
            }

            if shared.running.load(Ordering::Relaxed) {
                thread::sleep(shared.reconnect_interval);
            }
        }
    }

    /// Take the next frame without blocking
    pub fn try_recv(&self) -> Option<Bytes> {
        self.inbound_rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next frame
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Bytes> {
        self.inbound_rx.recv_timeout(timeout).ok()
    }

    pub fn is_dialed(&self, addr: &SocketAddr) -> bool {
        self.dialed.contains(addr)
    }

    pub fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            endpoints: self.dialed.len(),
            units_received: self.shared.units_received.load(Ordering::Relaxed),
            units_dropped: self.shared.units_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop every dial thread, each bounded by `timeout`
    pub fn close(&self, timeout: Duration) {
        self.shared.running.store(false, Ordering::SeqCst);

        let workers = std::mem::take(&mut *self.workers.lock());
        let detached = join_all(workers, timeout);
        if detached > 0 {
            tracing::warn!("{} subscriber: {} threads detached", self.shared.channel, detached);
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

/// Subscriber statistics
#[derive(Debug, Clone, Default)]
pub struct SubscriberStats {
    pub endpoints: usize,
    pub units_received: u64,
    pub units_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::publisher::Publisher;
    use crate::peers::PeerEndpoint;
    use std::time::Instant;

    fn loopback() -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".to_string(),
            reconnect_interval_ms: 20,
            ..Default::default()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_receives_from_publisher() {
        let config = loopback();
        let publisher = Publisher::bind("text", &config, 0).unwrap();
        let subscriber = Subscriber::new("text", 6000, &config);

        assert!(subscriber.connect(publisher.local_addr(), None).unwrap());
        assert!(!subscriber.connect(publisher.local_addr(), None).unwrap());
        wait_until(|| publisher.link_count() == 1);

        let me = PeerEndpoint::resolve("127.0.0.1", 6000).unwrap();
        assert!(publisher.has_link(&me));
        assert!(publisher.send_to(&me, Bytes::from_static(b"frame")));

        let frame = subscriber.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame.as_ref(), b"frame");
        assert!(subscriber.try_recv().is_none());

        subscriber.close(Duration::from_secs(1));
        publisher.close(Duration::from_secs(1));
    }

    #[test]
    fn test_reconnects_when_publisher_appears_later() {
        let config = loopback();

        // Reserve a port, then free it so the subscriber starts against nothing
        let reserved = Publisher::bind("video", &config, 0).unwrap();
        let port = reserved.local_addr().port();
        reserved.close(Duration::from_secs(1));
        drop(reserved);

        let subscriber = Subscriber::new("video", 6000, &config);
        subscriber
            .connect(SocketAddr::new("127.0.0.1".parse().unwrap(), port), None)
            .unwrap();
        thread::sleep(Duration::from_millis(100));

        let publisher = Publisher::bind("video", &config, port).unwrap();
        wait_until(|| publisher.link_count() == 1);
        assert_eq!(publisher.broadcast(&Bytes::from_static(b"late")), 1);
        assert_eq!(
            subscriber.recv_timeout(Duration::from_secs(5)).unwrap().as_ref(),
            b"late"
        );

        subscriber.close(Duration::from_secs(1));
        publisher.close(Duration::from_secs(1));
    }

    #[test]
    fn test_closed_subscriber_refuses_new_endpoints() {
        let subscriber = Subscriber::new("audio", 6000, &loopback());
        subscriber.close(Duration::from_millis(100));
        assert!(matches!(
            subscriber.connect("127.0.0.1:1".parse().unwrap(), None),
            Err(NetworkError::Closed)
        ));
    }

    #[test]
    fn test_announced_host_names_the_link() {
        let config = loopback();
        let publisher = Publisher::bind("video", &config, 0).unwrap();
        let subscriber = Subscriber::new("video", 6000, &config);

        let announced: IpAddr = "127.0.0.9".parse().unwrap();
        subscriber.connect(publisher.local_addr(), Some(announced)).unwrap();
        wait_until(|| publisher.link_count() == 1);

        // Keyed by the announced host, not the loopback source address
        assert!(publisher.has_link(&PeerEndpoint::new(announced, 6000)));
        assert!(!publisher.has_link(&PeerEndpoint::resolve("127.0.0.1", 6000).unwrap()));

        subscriber.close(Duration::from_secs(1));
        publisher.close(Duration::from_secs(1));
    }
}
