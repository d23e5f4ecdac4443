//! Request/reply control channel
//!
//! One request and one reply per connection, both as single text frames.
//! The server never blocks on a single connection: accepted streams are read
//! without blocking on every poll, and one that stays silent past
//! `REQUEST_READ_TIMEOUT` is dropped.

use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::framing::{write_frame, FrameDecoder, ReadStatus};
use crate::network::socket::{connect, create_listener, prepare_stream};

const ACCEPT_IDLE: Duration = Duration::from_millis(10);
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(1);
const REPLY_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const READ_SLICE: Duration = Duration::from_millis(50);

/// Reply side of the control channel
pub struct ControlServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    incoming: Mutex<Vec<Incoming>>,
}

/// Accepted connection whose request is still arriving
struct Incoming {
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    decoder: FrameDecoder,
    accepted: Instant,
}

/// A received request waiting for its reply
pub struct PendingRequest {
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    message: String,
}

impl PendingRequest {
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Source address of the request connection
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Our address as the requester dialed it
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn reply(mut self, reply: &str) -> Result<(), NetworkError> {
        write_frame(&mut self.stream, reply.as_bytes())
    }
}

impl ControlServer {
    pub fn bind(config: &NetworkConfig, port: u16) -> Result<Self, NetworkError> {
        let listener = create_listener(config, port)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        Ok(Self {
            listener,
            local_addr,
            incoming: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait up to `timeout` for one complete request.
    ///
    /// Sleeps between rounds instead of spinning. Connections still sending
    /// their request carry over to the next poll.
    pub fn poll(&self, timeout: Duration) -> Result<Option<PendingRequest>, NetworkError> {
        let deadline = Instant::now() + timeout;

        loop {
            self.accept_pending()?;
            if let Some(request) = self.next_request() {
                return Ok(Some(request));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(ACCEPT_IDLE.min(deadline - now));
        }
    }

    fn accept_pending(&self) -> Result<(), NetworkError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let local_addr = match stream.local_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            tracing::debug!("Dropping control connection from {}: {}", peer_addr, e);
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nonblocking(true) {
                        tracing::debug!("Dropping control connection from {}: {}", peer_addr, e);
                        continue;
                    }
                    self.incoming.lock().push(Incoming {
                        stream,
                        peer_addr,
                        local_addr,
                        decoder: FrameDecoder::new(),
                        accepted: Instant::now(),
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string())),
            }
        }
    }

    /// Read what has arrived on every open connection; hand out the first complete request
    fn next_request(&self) -> Option<PendingRequest> {
        let mut incoming = self.incoming.lock();
        let mut index = 0;

        while index < incoming.len() {
            let conn = &mut incoming[index];
            match conn.decoder.read_frame(&mut conn.stream) {
                Ok(ReadStatus::Frame(frame)) => {
                    let conn = incoming.swap_remove(index);
                    match Self::into_request(conn, &frame) {
                        Ok(request) => return Some(request),
                        Err(e) => tracing::debug!("Dropping control request: {}", e),
                    }
                }
                Ok(ReadStatus::Idle) if conn.accepted.elapsed() < REQUEST_READ_TIMEOUT => index += 1,
                Ok(ReadStatus::Idle) => {
                    let conn = incoming.swap_remove(index);
                    tracing::debug!("Control connection from {} sent no request", conn.peer_addr);
                }
                Err(e) => {
                    let conn = incoming.swap_remove(index);
                    tracing::debug!("Control connection from {} failed: {}", conn.peer_addr, e);
                }
            }
        }
        None
    }

    fn into_request(conn: Incoming, frame: &[u8]) -> Result<PendingRequest, NetworkError> {
        prepare_stream(&conn.stream)?;
        conn.stream
            .set_write_timeout(Some(REPLY_WRITE_TIMEOUT))
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        Ok(PendingRequest {
            stream: conn.stream,
            peer_addr: conn.peer_addr,
            local_addr: conn.local_addr,
            message: String::from_utf8_lossy(frame).into_owned(),
        })
    }
}

/// Send one request and block for its reply, bounded by `timeout` overall
pub fn request(addr: SocketAddr, message: &str, timeout: Duration) -> Result<String, NetworkError> {
    let started = Instant::now();
    let mut stream = connect(addr, timeout)?;

    stream
        .set_read_timeout(Some(READ_SLICE))
        .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

    write_frame(&mut stream, message.as_bytes())?;

    let remaining = timeout.saturating_sub(started.elapsed());
    let reply = FrameDecoder::new().read_frame_within(&mut stream, remaining)?;
    Ok(String::from_utf8_lossy(&reply).into_owned())
}
