//! Capture sources
//!
//! Real camera and microphone access lives outside this crate; the node only
//! needs something that hands it raw frames and sample blocks. The synthetic
//! sources here pace themselves like a device would, so the capture loops
//! can call them back to back.

use bytes::{BufMut, Bytes, BytesMut};
use std::f32::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::MediaConfig;
use crate::error::MediaError;

/// A camera-like source of raw RGB24 frames
pub trait VideoSource: Send {
    /// Block until the next frame is available.
    ///
    /// `Ok(None)` means the device produced no frame this time and the caller
    /// should try again. `Err(MediaError::DeviceUnavailable)` is permanent.
    fn capture_frame(&mut self) -> Result<Option<Bytes>, MediaError>;

    /// Frame geometry (width, height)
    fn dimensions(&self) -> (u16, u16);
}

/// A microphone-like source of interleaved f32 LE sample blocks
pub trait AudioSource: Send {
    /// Block until one full block has been captured
    fn capture_block(&mut self) -> Result<Bytes, MediaError>;
}

/// Sleeps until the next tick of a fixed period
struct Pacer {
    period: Duration,
    next: Instant,
}

impl Pacer {
    fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now(),
        }
    }

    fn wait(&mut self) {
        let now = Instant::now();
        if self.next > now {
            thread::sleep(self.next - now);
        } else if now - self.next > self.period {
            // Fell behind; resync instead of bursting
            self.next = now;
        }
        self.next += self.period;
    }
}

/// Moving colour-bar test pattern
pub struct PatternSource {
    width: u16,
    height: u16,
    frame_index: u64,
    pacer: Pacer,
}

impl PatternSource {
    pub fn new(width: u16, height: u16, frame_interval: Duration) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            frame_index: 0,
            pacer: Pacer::new(frame_interval),
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(config.frame_width, config.frame_height, config.frame_interval())
    }

    fn render(&self) -> Bytes {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut frame = BytesMut::with_capacity(w * h * 3);
        let offset = (self.frame_index as usize * 4) % w;

        for y in 0..h {
            for x in 0..w {
                let band = ((x + offset) * 8 / w) as u8;
                frame.put_u8(band.wrapping_mul(32));
                frame.put_u8((y * 255 / h.max(1)) as u8);
                frame.put_u8(255 - band.wrapping_mul(32));
            }
        }
        frame.freeze()
    }
}

impl VideoSource for PatternSource {
    fn capture_frame(&mut self) -> Result<Option<Bytes>, MediaError> {
        self.pacer.wait();
        let frame = self.render();
        self.frame_index += 1;
        Ok(Some(frame))
    }

    fn dimensions(&self) -> (u16, u16) {
        (self.width, self.height)
    }
}

/// Sine tone generator
pub struct ToneSource {
    frequency: f32,
    amplitude: f32,
    sample_rate: u32,
    channels: u16,
    block_size: usize,
    phase: f32,
    pacer: Pacer,
}

impl ToneSource {
    pub fn new(frequency: f32, config: &MediaConfig) -> Self {
        Self {
            frequency,
            amplitude: 0.2,
            sample_rate: config.sample_rate.max(1),
            channels: config.channels.max(1),
            block_size: config.audio_block_size,
            phase: 0.0,
            pacer: Pacer::new(config.audio_block_period()),
        }
    }
}

impl AudioSource for ToneSource {
    fn capture_block(&mut self) -> Result<Bytes, MediaError> {
        self.pacer.wait();

        let step = TAU * self.frequency / self.sample_rate as f32;
        let mut block =
            BytesMut::with_capacity(self.block_size * self.channels as usize * 4);

        for _ in 0..self.block_size {
            let sample = self.phase.sin() * self.amplitude;
            for _ in 0..self.channels {
                block.put_f32_le(sample);
            }
            self.phase = (self.phase + step) % TAU;
        }
        Ok(block.freeze())
    }
}
