//! Publishing side of a data channel
//!
//! A [`Publisher`] owns the listener for one channel port. Every subscriber
//! that connects becomes a downstream link with its own bounded queue and
//! writer thread, so a slow or stalled peer only ever loses its own units.
//! Links are keyed by the host the subscriber announces in its preamble, or
//! by its source address when it announces none.
//!
//! ```text
//!                  ┌── queue ──> writer ──> peer B
//! send_to / ───────┼── queue ──> writer ──> peer C   (full queue: unit dropped)
//! broadcast        └── queue ──> writer ──> peer D
//! ```

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::framing::{write_frame, FrameDecoder};
use crate::network::socket::{create_listener, prepare_stream};
use crate::peers::PeerEndpoint;
use crate::protocol::parse_subscription_preamble;
use crate::worker::{join_all, Worker};

const ACCEPT_IDLE: Duration = Duration::from_millis(10);
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const QUEUE_POLL: Duration = Duration::from_millis(50);

/// One connected subscriber
struct Link {
    id: u64,
    tx: Sender<Bytes>,
}

/// State shared with the accept and writer threads
struct Shared {
    channel: &'static str,
    links: DashMap<PeerEndpoint, Link>,
    writers: Mutex<Vec<Worker>>,
    running: AtomicBool,
    queue_depth: usize,
    next_link_id: AtomicU64,
    units_sent: AtomicU64,
    units_dropped: AtomicU64,
}

/// Publisher for one channel port
pub struct Publisher {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_worker: Mutex<Option<Worker>>,
}

impl Publisher {
    /// Bind `port` and start accepting subscribers
    pub fn bind(
        channel: &'static str,
        config: &NetworkConfig,
        port: u16,
    ) -> Result<Self, NetworkError> {
        let listener = create_listener(config, port)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let shared = Arc::new(Shared {
            channel,
            links: DashMap::new(),
            writers: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            queue_depth: config.send_queue_depth.max(1),
            next_link_id: AtomicU64::new(0),
            units_sent: AtomicU64::new(0),
            units_dropped: AtomicU64::new(0),
        });

        let accept_shared = shared.clone();
        let accept_worker = Worker::spawn(format!("{}-accept", channel), move || {
            Self::accept_loop(listener, accept_shared);
        })
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        tracing::debug!("{} publisher listening on {}", channel, local_addr);

        Ok(Self {
            shared,
            local_addr,
            accept_worker: Mutex::new(Some(accept_worker)),
        })
    }

    fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
        while shared.running.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let link_shared = shared.clone();
                    let spawned = Worker::spawn(
                        format!("{}-link-{}", shared.channel, addr),
                        move || Self::link_loop(stream, addr, link_shared),
                    );

                    match spawned {
                        Ok(worker) => {
                            let mut writers = shared.writers.lock();
                            writers.retain(|w| !w.is_finished());
                            writers.push(worker);
                        }
                        Err(e) => {
                            tracing::warn!("{}: cannot serve subscriber {}: {}", shared.channel, addr, e)
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_IDLE);
                }
                Err(e) => {
                    tracing::warn!("{}: accept failed: {}", shared.channel, e);
                    thread::sleep(ACCEPT_IDLE);
                }
            }
        }
    }

    /// Identify the subscriber, register its queue, then drain the queue into the socket
    fn link_loop(mut stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) {
        if let Err(e) = prepare_stream(&stream) {
            tracing::debug!("{}: dropping subscriber {}: {}", shared.channel, addr, e);
            return;
        }
        let _ = stream.set_read_timeout(Some(Duration::from_millis(100)));
        let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));

        let (base_port, announced) = match FrameDecoder::new()
            .read_frame_within(&mut stream, PREAMBLE_TIMEOUT)
            .ok()
            .and_then(|frame| parse_subscription_preamble(&frame))
        {
            Some(subscription) => subscription,
            None => {
                tracing::debug!("{}: subscriber {} sent no valid preamble", shared.channel, addr);
                return;
            }
        };

        let peer = PeerEndpoint::new(announced.unwrap_or(addr.ip()), base_port);
        let id = shared.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded::<Bytes>(shared.queue_depth);

        // A reconnecting peer replaces its previous link; the old writer sees its queue disconnect.
        shared.links.insert(peer, Link { id, tx });
        tracing::debug!("{}: subscriber {} attached", shared.channel, peer);

        Self::writer_loop(&mut stream, rx, &shared, peer);

        shared.links.remove_if(&peer, |_, link| link.id == id);
        tracing::debug!("{}: subscriber {} detached", shared.channel, peer);
    }

    fn writer_loop(stream: &mut TcpStream, rx: Receiver<Bytes>, shared: &Shared, peer: PeerEndpoint) {
        while shared.running.load(Ordering::Relaxed) {
            match rx.recv_timeout(QUEUE_POLL) {
                Ok(frame) => {
                    if let Err(e) = write_frame(stream, &frame) {
                        tracing::debug!("{}: write to {} failed: {}", shared.channel, peer, e);
                        return;
                    }
                    shared.units_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Queue `frame` for one peer without blocking. Returns false if dropped.
    pub fn send_to(&self, peer: &PeerEndpoint, frame: Bytes) -> bool {
        let Some(link) = self.shared.links.get(peer) else {
            self.shared.units_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        match link.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.shared.units_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Queue `frame` for every connected subscriber. Returns how many accepted it.
    pub fn broadcast(&self, frame: &Bytes) -> usize {
        let mut queued = 0;
        for link in self.shared.links.iter() {
            match link.tx.try_send(frame.clone()) {
                Ok(()) => queued += 1,
                Err(_) => {
                    self.shared.units_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        queued
    }

    pub fn has_link(&self, peer: &PeerEndpoint) -> bool {
        self.shared.links.contains_key(peer)
    }

    pub fn link_count(&self) -> usize {
        self.shared.links.len()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            links: self.link_count(),
            units_sent: self.shared.units_sent.load(Ordering::Relaxed),
            units_dropped: self.shared.units_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting, drop every link and join the threads, each bounded by `timeout`
    pub fn close(&self, timeout: Duration) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.links.clear();

        let mut workers: Vec<Worker> = self.accept_worker.lock().take().into_iter().collect();
        workers.append(&mut self.shared.writers.lock());

        let detached = join_all(workers, timeout);
        if detached > 0 {
            tracing::warn!("{} publisher: {} threads detached", self.shared.channel, detached);
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

/// Publisher statistics
#[derive(Debug, Clone, Default)]
pub struct PublisherStats {
    pub links: usize,
    pub units_sent: u64,
    pub units_dropped: u64,
}
