//! Output sinks
//!
//! The display, speaker and text console are supplied by the embedding
//! program. The logging implementations below stand in for them in the
//! headless binary.

use std::time::{Duration, Instant};

use crate::protocol::MediaUnit;

/// What the display wants the node to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayControl {
    Continue,
    /// Sentinel key pressed; stop the node
    Quit,
}

/// Renders received video
pub trait VideoDisplay: Send {
    /// Called once per display tick with the newest decoded frame, if any.
    /// `is_new` is false when the same frame is being repeated.
    fn present(&mut self, frame: Option<&MediaUnit>, is_new: bool) -> DisplayControl;
}

/// Plays received audio
pub trait AudioOutput: Send {
    /// Play one block of interleaved f32 LE samples
    fn play(&mut self, block: &[u8]);
}

/// Receives chat lines
pub trait TextSink: Send + Sync {
    fn on_text(&self, message: &str);
}

impl<F> TextSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_text(&self, message: &str) {
        self(message)
    }
}

/// A zero-filled block; all-zero bytes are 0.0 in f32
pub fn silence(block_bytes: usize) -> Vec<u8> {
    vec![0u8; block_bytes]
}

/// Headless display: counts frames and logs a summary periodically
pub struct LogDisplay {
    report_every: Duration,
    last_report: Instant,
    frames_shown: u64,
    frames_repeated: u64,
}

impl LogDisplay {
    pub fn new(report_every: Duration) -> Self {
        Self {
            report_every,
            last_report: Instant::now(),
            frames_shown: 0,
            frames_repeated: 0,
        }
    }
}

impl Default for LogDisplay {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl VideoDisplay for LogDisplay {
    fn present(&mut self, frame: Option<&MediaUnit>, is_new: bool) -> DisplayControl {
        match (frame, is_new) {
            (Some(_), true) => self.frames_shown += 1,
            (Some(_), false) => self.frames_repeated += 1,
            (None, _) => {}
        }

        if self.last_report.elapsed() >= self.report_every {
            if let Some(unit) = frame {
                tracing::debug!(
                    "Display: {} new, {} repeated, last frame {} bytes @ {}us",
                    self.frames_shown,
                    self.frames_repeated,
                    unit.payload.len(),
                    unit.timestamp_us
                );
            }
            self.last_report = Instant::now();
        }

        DisplayControl::Continue
    }
}

/// Headless speaker: tracks block level in dBFS and logs a summary periodically
pub struct LogSpeaker {
    report_every: Duration,
    last_report: Instant,
    reports: u64,
    blocks_played: u64,
    silent_blocks: u64,
    peak_db: f32,
    last_rms_db: f32,
}

impl LogSpeaker {
    pub fn new(report_every: Duration) -> Self {
        Self {
            report_every,
            last_report: Instant::now(),
            reports: 0,
            blocks_played: 0,
            silent_blocks: 0,
            peak_db: MIN_DB,
            last_rms_db: MIN_DB,
        }
    }

    pub fn blocks_played(&self) -> u64 {
        self.blocks_played
    }

    pub fn silent_blocks(&self) -> u64 {
        self.silent_blocks
    }

    /// Highest block peak seen so far
    pub fn peak_db(&self) -> f32 {
        self.peak_db
    }

    /// RMS level of the most recent block
    pub fn last_rms_db(&self) -> f32 {
        self.last_rms_db
    }

    pub fn reports(&self) -> u64 {
        self.reports
    }
}

impl Default for LogSpeaker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl AudioOutput for LogSpeaker {
    fn play(&mut self, block: &[u8]) {
        let level = BlockLevel::measure(block);
        self.blocks_played += 1;
        if level.peak_db <= MIN_DB {
            self.silent_blocks += 1;
        }
        self.peak_db = self.peak_db.max(level.peak_db);
        self.last_rms_db = level.rms_db;

        if self.last_report.elapsed() >= self.report_every {
            tracing::debug!(
                "Speaker: {} blocks, {} silent, level {:.1} dBFS rms, peak {:.1} dBFS",
                self.blocks_played,
                self.silent_blocks,
                self.last_rms_db,
                self.peak_db
            );
            self.reports += 1;
            self.last_report = Instant::now();
        }
    }
}

const MIN_DB: f32 = -96.0;

/// RMS and peak of one block of f32 LE samples
#[derive(Debug, Clone, Copy)]
pub struct BlockLevel {
    pub rms_db: f32,
    pub peak_db: f32,
}

impl BlockLevel {
    pub fn measure(block: &[u8]) -> Self {
        let mut sum_sq = 0.0f64;
        let mut peak = 0.0f32;
        let mut count = 0usize;

        for chunk in block.chunks_exact(4) {
            let sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if !sample.is_finite() {
                continue;
            }
            sum_sq += (sample as f64) * (sample as f64);
            peak = peak.max(sample.abs());
            count += 1;
        }

        let rms = if count > 0 {
            (sum_sq / count as f64).sqrt() as f32
        } else {
            0.0
        };

        Self {
            rms_db: to_db(rms),
            peak_db: to_db(peak),
        }
    }
}

fn to_db(linear: f32) -> f32 {
    if linear <= 0.0 {
        MIN_DB
    } else {
        (20.0 * linear.log10()).max(MIN_DB)
    }
}
