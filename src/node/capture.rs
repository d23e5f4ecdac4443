//! Capture and fan-out loops

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::MediaError;
use crate::media::{AudioSource, FrameCodec, VideoSource};
use crate::network::Publisher;
use crate::peers::PeerRegistry;
use crate::protocol::{MediaKind, MediaUnit};

const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Send one copy of `unit` to every connected peer.
///
/// Iterates a registry snapshot, so peers added meanwhile are picked up on
/// the next unit. Returns how many peers accepted the unit into their queue.
pub fn fan_out(publisher: &Publisher, registry: &PeerRegistry, unit: &MediaUnit) -> usize {
    let frame = unit.serialize();
    registry
        .connected()
        .iter()
        .filter(|peer| publisher.send_to(peer, frame.clone()))
        .count()
}

/// What a capture loop should do after a source error
fn on_source_error(kind: MediaKind, error: MediaError) -> bool {
    match error {
        MediaError::DeviceUnavailable(reason) => {
            tracing::warn!("{} capture stopped, device unavailable: {}", kind, reason);
            false
        }
        other => {
            tracing::debug!("{} capture error: {}", kind, other);
            thread::sleep(ERROR_BACKOFF);
            true
        }
    }
}

pub fn run_video_capture(
    mut source: Box<dyn VideoSource>,
    codec: Arc<dyn FrameCodec>,
    publisher: Arc<Publisher>,
    registry: Arc<PeerRegistry>,
    running: Arc<AtomicBool>,
) {
    let (width, height) = source.dimensions();
    tracing::debug!("Video capture started ({}x{})", width, height);

    while running.load(Ordering::Relaxed) {
        let frame = match source.capture_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                if on_source_error(MediaKind::Video, e) {
                    continue;
                }
                break;
            }
        };

        if registry.is_empty() {
            continue;
        }

        match codec.encode(&frame) {
            Ok(encoded) => {
                fan_out(&publisher, &registry, &MediaUnit::captured(MediaKind::Video, encoded));
            }
            Err(e) => tracing::debug!("Frame encode failed: {}", e),
        }
    }

    tracing::debug!("Video capture stopped");
}

pub fn run_audio_capture(
    mut source: Box<dyn AudioSource>,
    publisher: Arc<Publisher>,
    registry: Arc<PeerRegistry>,
    running: Arc<AtomicBool>,
) {
    tracing::debug!("Audio capture started");

    while running.load(Ordering::Relaxed) {
        let block = match source.capture_block() {
            Ok(block) => block,
            Err(e) => {
                if on_source_error(MediaKind::Audio, e) {
                    continue;
                }
                break;
            }
        };

        if !registry.is_empty() {
            fan_out(&publisher, &registry, &MediaUnit::captured(MediaKind::Audio, block));
        }
    }

    tracing::debug!("Audio capture stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::network::Subscriber;
    use crate::peers::PeerEndpoint;
    use bytes::Bytes;
    use std::time::Instant;

    struct BrokenCamera;

    impl VideoSource for BrokenCamera {
        fn capture_frame(&mut self) -> Result<Option<Bytes>, MediaError> {
            Err(MediaError::DeviceUnavailable("no camera".into()))
        }

        fn dimensions(&self) -> (u16, u16) {
            (0, 0)
        }
    }

    fn loopback() -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".to_string(),
            reconnect_interval_ms: 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_fan_out_reaches_only_registered_peers() {
        let config = loopback();
        let publisher = Publisher::bind("video", &config, 0).unwrap();
        let registry = PeerRegistry::new();

        let paired = Subscriber::new("video", 6000, &config);
        let stranger = Subscriber::new("video", 7000, &config);
        paired.connect(publisher.local_addr(), None).unwrap();
        stranger.connect(publisher.local_addr(), None).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while publisher.link_count() < 2 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        registry.insert_connected(PeerEndpoint::resolve("127.0.0.1", 6000).unwrap());
        let unit = MediaUnit::new(MediaKind::Video, 1, Bytes::from_static(b"jpeg"));
        assert_eq!(fan_out(&publisher, &registry, &unit), 1);

        let received = paired.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(MediaUnit::deserialize(received).unwrap(), unit);
        assert!(stranger.recv_timeout(Duration::from_millis(200)).is_none());

        paired.close(Duration::from_secs(1));
        stranger.close(Duration::from_secs(1));
        publisher.close(Duration::from_secs(1));
    }

    #[test]
    fn test_fan_out_with_no_peers_sends_nothing() {
        let publisher = Publisher::bind("audio", &loopback(), 0).unwrap();
        let unit = MediaUnit::new(MediaKind::Audio, 1, Bytes::from_static(b"pcm"));
        assert_eq!(fan_out(&publisher, &PeerRegistry::new(), &unit), 0);
        assert_eq!(publisher.stats().units_sent, 0);
    }

    #[test]
    fn test_unavailable_device_ends_loop() {
        let publisher = Arc::new(Publisher::bind("video", &loopback(), 0).unwrap());
        let running = Arc::new(AtomicBool::new(true));
        let codec: Arc<dyn FrameCodec> = Arc::new(crate::media::RawFrameCodec::new(1, 1));

        // Returns on its own while the node keeps running
        run_video_capture(
            Box::new(BrokenCamera),
            codec,
            publisher.clone(),
            Arc::new(PeerRegistry::new()),
            running.clone(),
        );
        assert!(running.load(Ordering::Relaxed));
        publisher.close(Duration::from_secs(1));
    }
}
