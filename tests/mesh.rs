//! Two-node scenarios over loopback

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lan_media_mesh::config::NodeConfig;
use lan_media_mesh::error::PairingError;
use lan_media_mesh::media::{
    DisplayControl, PatternSource, RawFrameCodec, TextSink, ToneSource, VideoDisplay,
};
use lan_media_mesh::protocol::MediaUnit;
use lan_media_mesh::{Collaborators, MeshNode, PeerEndpoint};

fn config(base_port: u16) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.network.bind_address = "127.0.0.1".to_string();
    config.network.base_port = base_port;
    config.network.reconnect_interval_ms = 20;
    config.network.handshake_timeout_ms = 2000;
    config.media.video_enabled = false;
    config.media.audio_enabled = false;
    config
}

fn inbox() -> (Arc<Mutex<Vec<String>>>, Arc<dyn TextSink>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink_lines = lines.clone();
    let sink: Arc<dyn TextSink> = Arc::new(move |line: &str| sink_lines.lock().push(line.to_string()));
    (lines, sink)
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

fn endpoint(port: u16) -> PeerEndpoint {
    PeerEndpoint::resolve("127.0.0.1", port).unwrap()
}

/// Counts presented frames
#[derive(Default)]
struct CountingDisplay {
    new_frames: AtomicU64,
}

struct SharedDisplay(Arc<CountingDisplay>);

impl VideoDisplay for SharedDisplay {
    fn present(&mut self, frame: Option<&MediaUnit>, is_new: bool) -> DisplayControl {
        if frame.is_some() && is_new {
            self.0.new_frames.fetch_add(1, Ordering::Relaxed);
        }
        DisplayControl::Continue
    }
}

/// Video on, audio off, a small pattern source and no display
fn video_node(mut config: NodeConfig) -> MeshNode {
    config.media.video_enabled = true;
    let collaborators = Collaborators {
        video_source: Some(Box::new(PatternSource::new(8, 8, Duration::from_millis(10)))),
        audio_source: None,
        codec: Arc::new(RawFrameCodec::new(8, 8)),
        display: None,
        speaker: None,
        text_sink: inbox().1,
    };
    MeshNode::start(config, collaborators).unwrap()
}

#[test]
fn test_two_nodes_pair_and_chat() {
    let (a_lines, a_sink) = inbox();
    let (b_lines, b_sink) = inbox();
    let a = MeshNode::start(config(47000), Collaborators::text_only(a_sink)).unwrap();
    let b = MeshNode::start(config(47100), Collaborators::text_only(b_sink)).unwrap();

    a.pair_with("localhost", 47100).unwrap();
    assert_eq!(a.peers(), vec![endpoint(47100)]);

    // B pairs back on its own
    wait_until("reciprocal pairing", || b.peers() == vec![endpoint(47000)]);

    wait_until("text links", || {
        a.stats().text_out.links == 1 && b.stats().text_out.links == 1
    });

    assert_eq!(a.send_text("hello"), 1);
    wait_until("text at B", || !b_lines.lock().is_empty());
    assert_eq!(b_lines.lock().as_slice(), ["[47000]: hello".to_string()]);

    b.send_text("hi back");
    wait_until("text at A", || !a_lines.lock().is_empty());
    assert_eq!(a_lines.lock().as_slice(), ["[47100]: hi back".to_string()]);

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_repeated_pairing_is_noop() {
    let (_, a_sink) = inbox();
    let (_, b_sink) = inbox();
    let a = MeshNode::start(config(47200), Collaborators::text_only(a_sink)).unwrap();
    let b = MeshNode::start(config(47300), Collaborators::text_only(b_sink)).unwrap();

    a.pair_with("127.0.0.1", 47300).unwrap();
    for _ in 0..3 {
        let err = a.pair_with("127.0.0.1", 47300).unwrap_err();
        assert!(matches!(err, PairingError::AlreadyPaired(_)));
    }
    assert_eq!(a.peers().len(), 1);
    assert_eq!(a.stats().text_in.endpoints, 1);

    wait_until("reciprocal pairing", || b.peers().len() == 1);
    // B answering our second CONNECT would have been a duplicate too
    assert!(b.pair_with("127.0.0.1", 47200).is_err());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_unreachable_peer_reports_failure() {
    let (_, sink) = inbox();
    let mut cfg = config(47400);
    cfg.network.handshake_timeout_ms = 300;
    let a = MeshNode::start(cfg, Collaborators::text_only(sink)).unwrap();

    let started = Instant::now();
    let err = a.pair_with("127.0.0.1", 47500).unwrap_err();
    assert!(matches!(err, PairingError::Transport { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(a.peers().is_empty());
    assert!(a.registry().state(&endpoint(47500)).is_none());

    a.shutdown();
}

#[test]
fn test_direct_pairing_registers_initiator() {
    let (_, a_sink) = inbox();
    let (b_lines, b_sink) = inbox();
    let a = MeshNode::start(config(47600), Collaborators::text_only(a_sink)).unwrap();

    let mut b_config = config(47700);
    b_config.pairing.reciprocal = false;
    let b = MeshNode::start(b_config, Collaborators::text_only(b_sink)).unwrap();

    a.pair_with("127.0.0.1", 47700).unwrap();
    // Registered before the OK was sent
    assert_eq!(b.peers(), vec![endpoint(47600)]);

    wait_until("text link", || a.stats().text_out.links == 1);
    a.send_text("direct");
    wait_until("text at B", || !b_lines.lock().is_empty());
    assert_eq!(b_lines.lock()[0], "[47600]: direct");

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_media_flows_only_after_pairing() {
    let mut a_config = config(47800);
    a_config.media.video_enabled = true;
    a_config.media.audio_enabled = true;
    a_config.media.audio_block_size = 256;
    let mut b_config = a_config.clone();
    b_config.network.base_port = 47900;

    let media = a_config.media.clone();
    let a_collab = Collaborators {
        video_source: Some(Box::new(PatternSource::new(8, 8, Duration::from_millis(10)))),
        audio_source: Some(Box::new(ToneSource::new(440.0, &media))),
        codec: Arc::new(RawFrameCodec::new(8, 8)),
        display: None,
        speaker: None,
        text_sink: inbox().1,
    };
    let display = Arc::new(CountingDisplay::default());
    let b_collab = Collaborators {
        video_source: None,
        audio_source: None,
        codec: Arc::new(RawFrameCodec::new(8, 8)),
        display: Some(Box::new(SharedDisplay(display.clone()))),
        speaker: None,
        text_sink: inbox().1,
    };

    let a = MeshNode::start(a_config, a_collab).unwrap();
    let b = MeshNode::start(b_config, b_collab).unwrap();

    // Nobody is paired: A captures but sends nothing
    thread::sleep(Duration::from_millis(200));
    let before = a.stats();
    assert_eq!(before.video_out.unwrap().units_sent, 0);
    assert_eq!(before.audio_out.unwrap().units_sent, 0);

    b.pair_with("127.0.0.1", 47800).unwrap();
    wait_until("video at B", || b.stats().video_buffer.pushed > 0);
    wait_until("audio at B", || b.stats().audio_buffer.pushed > 0);
    wait_until("display", || display.new_frames.load(Ordering::Relaxed) > 0);

    let stats = b.stats();
    assert!(stats.video_buffer.len <= stats.video_buffer.capacity);
    assert_eq!(stats.malformed_video, 0);

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_advertised_initiator_receives_media() {
    // A listens and announces itself on a second loopback address
    let mut a_config = config(48200);
    a_config.network.bind_address = "127.0.0.3".to_string();
    a_config.network.advertise_address = Some("127.0.0.3".to_string());
    let a = video_node(a_config);
    let b = video_node(config(48300));

    a.pair_with("127.0.0.1", 48300).unwrap();
    let a_identity = PeerEndpoint::resolve("127.0.0.3", 48200).unwrap();
    wait_until("reciprocal pairing", || b.peers() == vec![a_identity]);

    wait_until("video at A", || a.stats().video_buffer.pushed > 0);
    wait_until("video at B", || b.stats().video_buffer.pushed > 0);
    assert_eq!(a.peers(), vec![endpoint(48300)]);
    assert_eq!(b.stats().video_out.unwrap().links, 1);

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_pairing_through_second_address_registers_once() {
    let a = video_node(config(48000));
    let mut b_config = config(48100);
    b_config.network.bind_address = "0.0.0.0".to_string();
    let b = video_node(b_config);

    // Dialed as 127.0.0.2, while A's connections leave from 127.0.0.1
    let b_identity = PeerEndpoint::resolve("127.0.0.2", 48100).unwrap();
    a.pair_with("127.0.0.2", 48100).unwrap();
    wait_until("reciprocal pairing", || b.peers().len() == 1);

    wait_until("video at A", || a.stats().video_buffer.pushed > 0);
    wait_until("video at B", || b.stats().video_buffer.pushed > 0);

    // The pair-back announced the address A dialed, so it was a duplicate
    thread::sleep(Duration::from_millis(200));
    assert_eq!(a.peers(), vec![b_identity]);
    assert_eq!(b.peers().len(), 1);

    a.shutdown();
    b.shutdown();
}
