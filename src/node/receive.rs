//! Receive loops
//!
//! Each loop polls its subscriber without blocking and sleeps for the idle
//! interval when nothing is queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::media::{FrameCodec, SharedBuffer, TextSink};
use crate::network::Subscriber;
use crate::protocol::{MediaKind, MediaUnit};

/// Units discarded on receipt
#[derive(Debug, Default)]
pub struct ReceiveCounters {
    pub malformed_video: AtomicU64,
    pub malformed_audio: AtomicU64,
}

impl ReceiveCounters {
    fn count(&self, kind: MediaKind) {
        let counter = match kind {
            MediaKind::Video => &self.malformed_video,
            MediaKind::Audio => &self.malformed_audio,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Parse a received frame as a unit of the expected kind
fn parse_unit(frame: bytes::Bytes, expected: MediaKind) -> Option<MediaUnit> {
    match MediaUnit::deserialize(frame) {
        Ok(unit) if unit.kind == expected => Some(unit),
        Ok(unit) => {
            tracing::debug!("Dropping {} unit received on the {} channel", unit.kind, expected);
            None
        }
        Err(e) => {
            tracing::debug!("Dropping malformed {} unit: {}", expected, e);
            None
        }
    }
}

pub fn run_text_receiver(
    subscriber: Arc<Subscriber>,
    sink: Arc<dyn TextSink>,
    running: Arc<AtomicBool>,
    idle: Duration,
) {
    while running.load(Ordering::Relaxed) {
        match subscriber.try_recv() {
            Some(frame) => sink.on_text(&String::from_utf8_lossy(&frame)),
            None => thread::sleep(idle),
        }
    }
}

/// Decode received frames into the keep-latest video buffer
pub fn run_video_receiver(
    subscriber: Arc<Subscriber>,
    codec: Arc<dyn FrameCodec>,
    buffer: SharedBuffer<MediaUnit>,
    counters: Arc<ReceiveCounters>,
    running: Arc<AtomicBool>,
    idle: Duration,
) {
    while running.load(Ordering::Relaxed) {
        let Some(frame) = subscriber.try_recv() else {
            thread::sleep(idle);
            continue;
        };

        let decoded = parse_unit(frame, MediaKind::Video).and_then(|unit| {
            codec
                .decode(&unit.payload)
                .map(|raw| unit.with_payload(raw))
        });

        match decoded {
            Some(unit) => {
                buffer.push(unit);
            }
            None => counters.count(MediaKind::Video),
        }
    }
}

/// Queue received blocks into the FIFO audio buffer
pub fn run_audio_receiver(
    subscriber: Arc<Subscriber>,
    buffer: SharedBuffer<MediaUnit>,
    counters: Arc<ReceiveCounters>,
    running: Arc<AtomicBool>,
    idle: Duration,
) {
    while running.load(Ordering::Relaxed) {
        let Some(frame) = subscriber.try_recv() else {
            thread::sleep(idle);
            continue;
        };

        match parse_unit(frame, MediaKind::Audio) {
            Some(unit) => {
                buffer.push(unit);
            }
            None => counters.count(MediaKind::Audio),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::media::{IngressBuffer, RawFrameCodec};
    use crate::network::Publisher;
    use bytes::Bytes;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_video_receiver_decodes_and_drops_corrupt_frames() {
        let config = NetworkConfig {
            bind_address: "127.0.0.1".to_string(),
            reconnect_interval_ms: 20,
            ..Default::default()
        };
        let publisher = Publisher::bind("video", &config, 0).unwrap();
        let subscriber = Arc::new(Subscriber::new("video", 6000, &config));
        subscriber.connect(publisher.local_addr(), None).unwrap();
        wait_until(|| publisher.link_count() == 1);

        let codec = RawFrameCodec::new(1, 1);
        let buffer = Arc::new(IngressBuffer::new(10));
        let counters = Arc::new(ReceiveCounters::default());
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let codec: Arc<dyn FrameCodec> = Arc::new(RawFrameCodec::new(1, 1));
            let (subscriber, buffer, counters, running) =
                (subscriber.clone(), buffer.clone(), counters.clone(), running.clone());
            thread::spawn(move || {
                run_video_receiver(subscriber, codec, buffer, counters, running, Duration::from_millis(1))
            })
        };

        let good = MediaUnit::new(MediaKind::Video, 7, codec.encode(&[1, 2, 3]).unwrap());
        let corrupt = MediaUnit::new(MediaKind::Video, 8, Bytes::from_static(b"not a frame"));
        let wrong_kind = MediaUnit::new(MediaKind::Audio, 9, Bytes::from_static(b"pcm"));

        publisher.broadcast(&corrupt.serialize());
        publisher.broadcast(&Bytes::from_static(b"xx"));
        publisher.broadcast(&wrong_kind.serialize());
        publisher.broadcast(&good.serialize());

        wait_until(|| buffer.generation() == 1);
        wait_until(|| counters.malformed_video.load(Ordering::Relaxed) == 3);

        let (_, latest) = buffer.latest().unwrap();
        assert_eq!(latest.timestamp_us, 7);
        assert_eq!(latest.payload.as_ref(), &[1, 2, 3]);

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        subscriber.close(Duration::from_secs(1));
        publisher.close(Duration::from_secs(1));
    }
}
