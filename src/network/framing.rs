//! Length-prefixed framing shared by every channel
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (4 bytes) │ Payload (variable)       │
//! │ Big-endian u32   │ media unit / text / ctrl │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! Reads go through [`FrameDecoder`], which accumulates partial data so a
//! read timeout in the middle of a frame never desynchronises the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::NetworkError;

const LENGTH_PREFIX: usize = 4;
const READ_CHUNK: usize = 64 * 1024;

/// Write one frame
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), NetworkError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);

    writer
        .write_all(&buf)
        .map_err(|e| NetworkError::SendFailed(e.to_string()))
}

/// Outcome of one read attempt
#[derive(Debug)]
pub enum ReadStatus {
    /// A complete frame
    Frame(Bytes),
    /// Read timed out with no complete frame yet
    Idle,
}

/// Incremental frame decoder
pub struct FrameDecoder {
    buf: BytesMut,
    chunk: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Append raw bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete frame out of the buffer
    pub fn decode(&mut self) -> Result<Option<Bytes>, NetworkError> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(NetworkError::FrameTooLarge(len));
        }

        if self.buf.len() < LENGTH_PREFIX + len {
            self.buf.reserve(LENGTH_PREFIX + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Read until a frame is complete or the stream's read timeout elapses.
    ///
    /// The stream must have a read timeout set; otherwise this blocks until data arrives.
    pub fn read_frame<R: Read>(&mut self, reader: &mut R) -> Result<ReadStatus, NetworkError> {
        loop {
            if let Some(frame) = self.decode()? {
                return Ok(ReadStatus::Frame(frame));
            }

            match reader.read(&mut self.chunk) {
                Ok(0) => return Err(NetworkError::Closed),
                Ok(n) => self.buf.extend_from_slice(&self.chunk[..n]),
                Err(ref e) if is_timeout(e) => return Ok(ReadStatus::Idle),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string())),
            }
        }
    }

    /// Read one frame, giving up after `timeout` of total waiting
    pub fn read_frame_within<R: Read>(
        &mut self,
        reader: &mut R,
        timeout: Duration,
    ) -> Result<Bytes, NetworkError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read_frame(reader)? {
                ReadStatus::Frame(frame) => return Ok(frame),
                ReadStatus::Idle if Instant::now() >= deadline => {
                    return Err(NetworkError::Timeout("reply"));
                }
                ReadStatus::Idle => {}
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// True for the error kinds a socket read timeout produces
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
