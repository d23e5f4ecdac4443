//! Display and playback loops

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::media::sink::silence;
use crate::media::{AudioOutput, DisplayControl, SharedBuffer, VideoDisplay};
use crate::protocol::MediaUnit;

/// Show the newest frame once per display tick.
///
/// The same frame is presented again (with `is_new == false`) until a newer
/// one arrives. Returns early and clears `running` when the display asks to quit.
pub fn run_display(
    mut display: Box<dyn VideoDisplay>,
    buffer: SharedBuffer<MediaUnit>,
    running: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut shown_generation = 0u64;

    while running.load(Ordering::Relaxed) {
        let latest = buffer.latest();
        let control = match &latest {
            Some((generation, unit)) => {
                let is_new = *generation != shown_generation;
                shown_generation = *generation;
                display.present(Some(unit), is_new)
            }
            None => display.present(None, false),
        };

        if control == DisplayControl::Quit {
            tracing::info!("Display requested shutdown");
            running.store(false, Ordering::SeqCst);
            break;
        }

        thread::sleep(interval);
    }
}

/// Pull exactly one block per period; play silence when nothing is queued
pub fn run_playback(
    mut output: Box<dyn AudioOutput>,
    buffer: SharedBuffer<MediaUnit>,
    running: Arc<AtomicBool>,
    period: Duration,
    block_bytes: usize,
) {
    let silent_block = silence(block_bytes);
    let mut next_tick = Instant::now();

    while running.load(Ordering::Relaxed) {
        match buffer.pop_oldest() {
            Some(unit) => output.play(&unit.payload),
            None => output.play(&silent_block),
        }

        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }
}
