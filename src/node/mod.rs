//! Mesh node
//!
//! Owns the channel sockets, the peer registry, the ingress buffers and one
//! worker thread per loop:
//!
//! ```text
//! capture-video ──┐                               ┌── receive-video ──> video buffer ──> display
//! capture-audio ──┼──> publishers ···· peers ···· subscribers ── receive-audio ──> audio buffer ──> playback
//!                 │                               └── receive-text ──> text sink
//! control ── pairing handshake ──> registry (gates capture fan-out)
//! ```
//!
//! All loops share one running flag. [`MeshNode::shutdown`] clears it, joins
//! every worker with a bounded timeout and then closes the sockets.

pub mod capture;
pub mod consume;
pub mod receive;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::NodeConfig;
use crate::error::{PairingError, Result};
use crate::media::{
    AudioOutput, AudioSource, BufferStats, FrameCodec, IngressBuffer, LogDisplay, LogSpeaker,
    PatternSource, RawFrameCodec, SharedBuffer, TextSink, ToneSource, VideoDisplay, VideoSource,
};
use crate::network::handshake::local_endpoint;
use crate::network::{
    ControlServer, PairingService, PairingSettings, Publisher, PublisherStats, Subscriber,
    SubscriberStats, Subscriptions,
};
use crate::peers::{PeerEndpoint, PeerRegistry};
use crate::protocol::{format_text_message, ChannelSet, MediaUnit};
use crate::worker::{join_all, Worker};

use receive::ReceiveCounters;

/// External collaborators plugged into the node.
///
/// A missing source or sink disables that loop only; the matching channel
/// still publishes or receives.
pub struct Collaborators {
    pub video_source: Option<Box<dyn VideoSource>>,
    pub audio_source: Option<Box<dyn AudioSource>>,
    pub codec: Arc<dyn FrameCodec>,
    pub display: Option<Box<dyn VideoDisplay>>,
    pub speaker: Option<Box<dyn AudioOutput>>,
    pub text_sink: Arc<dyn TextSink>,
}

impl Collaborators {
    /// Synthetic camera and tone, logging display and speaker
    pub fn headless(config: &NodeConfig, text_sink: Arc<dyn TextSink>) -> Self {
        let media = &config.media;
        Self {
            video_source: Some(Box::new(PatternSource::from_config(media))),
            audio_source: Some(Box::new(ToneSource::new(440.0, media))),
            codec: Arc::new(RawFrameCodec::new(media.frame_width, media.frame_height)),
            display: Some(Box::new(LogDisplay::default())),
            speaker: Some(Box::new(LogSpeaker::default())),
            text_sink,
        }
    }

    /// Text only: no capture and no output devices
    pub fn text_only(text_sink: Arc<dyn TextSink>) -> Self {
        Self {
            video_source: None,
            audio_source: None,
            codec: Arc::new(RawFrameCodec::new(1, 1)),
            display: None,
            speaker: None,
            text_sink,
        }
    }
}

struct Publishers {
    text: Arc<Publisher>,
    video: Option<Arc<Publisher>>,
    audio: Option<Arc<Publisher>>,
}

/// Node statistics
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub peers: usize,
    pub text_out: PublisherStats,
    pub video_out: Option<PublisherStats>,
    pub audio_out: Option<PublisherStats>,
    pub text_in: SubscriberStats,
    pub video_in: Option<SubscriberStats>,
    pub audio_in: Option<SubscriberStats>,
    pub video_buffer: BufferStats,
    pub audio_buffer: BufferStats,
    pub malformed_video: u64,
    pub malformed_audio: u64,
}

/// A running mesh node
pub struct MeshNode {
    config: NodeConfig,
    channels: ChannelSet,
    running: Arc<AtomicBool>,
    closed: AtomicBool,
    registry: Arc<PeerRegistry>,
    pairing: Arc<PairingService>,
    publishers: Publishers,
    subscriptions: Arc<Subscriptions>,
    video_buffer: SharedBuffer<MediaUnit>,
    audio_buffer: SharedBuffer<MediaUnit>,
    counters: Arc<ReceiveCounters>,
    workers: Mutex<Vec<Worker>>,
}

impl MeshNode {
    /// Bind every channel, then start all loops.
    ///
    /// Fails without starting any thread if a port cannot be bound.
    pub fn start(config: NodeConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let net = &config.network;
        let media = &config.media;
        let channels = ChannelSet::new(net.base_port);

        let publishers = Publishers {
            text: Arc::new(Publisher::bind("text", net, channels.text())?),
            video: if media.video_enabled {
                Some(Arc::new(Publisher::bind("video", net, channels.video())?))
            } else {
                None
            },
            audio: if media.audio_enabled {
                Some(Arc::new(Publisher::bind("audio", net, channels.audio())?))
            } else {
                None
            },
        };
        let control = ControlServer::bind(net, channels.control())?;

        let subscriptions = Arc::new(Subscriptions {
            text: Arc::new(Subscriber::new("text", net.base_port, net)),
            video: media
                .video_enabled
                .then(|| Arc::new(Subscriber::new("video", net.base_port, net))),
            audio: media
                .audio_enabled
                .then(|| Arc::new(Subscriber::new("audio", net.base_port, net))),
        });

        let running = Arc::new(AtomicBool::new(true));
        let registry = Arc::new(PeerRegistry::new());
        let local = local_endpoint(net.advertise_address.as_deref(), net.base_port)?;
        let pairing = Arc::new(PairingService::new(
            local,
            PairingSettings {
                advertise_address: net.advertise_address.clone(),
                timeout: net.handshake_timeout(),
                reciprocal: config.pairing.reciprocal,
            },
            registry.clone(),
            subscriptions.clone(),
            running.clone(),
        ));

        let node = Self {
            channels,
            running,
            closed: AtomicBool::new(false),
            registry,
            pairing,
            publishers,
            subscriptions,
            video_buffer: Arc::new(IngressBuffer::new(media.video_buffer_capacity)),
            audio_buffer: Arc::new(IngressBuffer::new(media.audio_buffer_capacity)),
            counters: Arc::new(ReceiveCounters::default()),
            workers: Mutex::new(Vec::new()),
            config,
        };

        if let Err(e) = node.spawn_loops(control, collaborators) {
            node.shutdown();
            return Err(e);
        }

        tracing::info!(
            "Node listening on {} (text {}, video {}, control {}, audio {})",
            node.config.network.bind_address,
            node.channels.text(),
            node.channels.video(),
            node.channels.control(),
            node.channels.audio()
        );

        Ok(node)
    }

    fn spawn(&self, name: &str, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let worker = Worker::spawn(name, f)?;
        self.workers.lock().push(worker);
        Ok(())
    }

    fn spawn_loops(&self, control: ControlServer, collaborators: Collaborators) -> Result<()> {
        let idle = self.config.network.receive_idle();
        let media = &self.config.media;

        let pairing = self.pairing.clone();
        self.spawn("control", move || pairing.run_control_loop(control))?;

        let (sub, sink, running) = (
            self.subscriptions.text.clone(),
            collaborators.text_sink,
            self.running.clone(),
        );
        self.spawn("receive-text", move || {
            receive::run_text_receiver(sub, sink, running, idle)
        })?;

        if let (Some(publisher), Some(subscriber)) =
            (&self.publishers.video, &self.subscriptions.video)
        {
            if let Some(source) = collaborators.video_source {
                let (codec, publisher, registry, running) = (
                    collaborators.codec.clone(),
                    publisher.clone(),
                    self.registry.clone(),
                    self.running.clone(),
                );
                self.spawn("capture-video", move || {
                    capture::run_video_capture(source, codec, publisher, registry, running)
                })?;
            }

            let (sub, codec, buffer, counters, running) = (
                subscriber.clone(),
                collaborators.codec.clone(),
                self.video_buffer.clone(),
                self.counters.clone(),
                self.running.clone(),
            );
            self.spawn("receive-video", move || {
                receive::run_video_receiver(sub, codec, buffer, counters, running, idle)
            })?;

            if let Some(display) = collaborators.display {
                let (buffer, running, interval) = (
                    self.video_buffer.clone(),
                    self.running.clone(),
                    media.display_interval(),
                );
                self.spawn("display", move || {
                    consume::run_display(display, buffer, running, interval)
                })?;
            }
        }

        if let (Some(publisher), Some(subscriber)) =
            (&self.publishers.audio, &self.subscriptions.audio)
        {
            if let Some(source) = collaborators.audio_source {
                let (publisher, registry, running) =
                    (publisher.clone(), self.registry.clone(), self.running.clone());
                self.spawn("capture-audio", move || {
                    capture::run_audio_capture(source, publisher, registry, running)
                })?;
            }

            let (sub, buffer, counters, running) = (
                subscriber.clone(),
                self.audio_buffer.clone(),
                self.counters.clone(),
                self.running.clone(),
            );
            self.spawn("receive-audio", move || {
                receive::run_audio_receiver(sub, buffer, counters, running, idle)
            })?;

            if let Some(speaker) = collaborators.speaker {
                let (buffer, running, period, block_bytes) = (
                    self.audio_buffer.clone(),
                    self.running.clone(),
                    media.audio_block_period(),
                    media.audio_block_bytes(),
                );
                self.spawn("playback", move || {
                    consume::run_playback(speaker, buffer, running, period, block_bytes)
                })?;
            }
        }

        Ok(())
    }

    /// Pair with the node at `host:base_port`.
    ///
    /// Blocks for at most the handshake timeout.
    pub fn pair_with(&self, host: &str, base_port: u16) -> std::result::Result<(), PairingError> {
        let peer = PeerEndpoint::resolve(host, base_port).map_err(|source| PairingError::Transport {
            peer: format!("{}:{}", host, base_port),
            source,
        })?;
        self.pairing.initiate(peer)
    }

    /// Publish a chat line to every connected text subscriber.
    ///
    /// Returns how many subscribers it was queued for.
    pub fn send_text(&self, message: &str) -> usize {
        let line = format_text_message(self.channels.base_port(), message);
        self.publishers.text.broadcast(&Bytes::from(line))
    }

    /// Connected peers, sorted
    pub fn peers(&self) -> Vec<PeerEndpoint> {
        self.registry.connected()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn local(&self) -> PeerEndpoint {
        self.pairing.local()
    }

    pub fn channels(&self) -> ChannelSet {
        self.channels
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Shared running flag; clearing it stops every loop
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            peers: self.registry.len(),
            text_out: self.publishers.text.stats(),
            video_out: self.publishers.video.as_ref().map(|p| p.stats()),
            audio_out: self.publishers.audio.as_ref().map(|p| p.stats()),
            text_in: self.subscriptions.text.stats(),
            video_in: self.subscriptions.video.as_ref().map(|s| s.stats()),
            audio_in: self.subscriptions.audio.as_ref().map(|s| s.stats()),
            video_buffer: self.video_buffer.stats(),
            audio_buffer: self.audio_buffer.stats(),
            malformed_video: self.counters.malformed_video.load(Ordering::Relaxed),
            malformed_audio: self.counters.malformed_audio.load(Ordering::Relaxed),
        }
    }

    /// Stop every loop, then release the channels.
    ///
    /// Each worker gets the configured join timeout; one that does not exit
    /// in time is detached. Safe to call more than once.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        let timeout = self.config.network.join_timeout();
        let detached = join_all(workers, timeout);
        if detached > 0 {
            tracing::warn!("{} node threads did not stop in time", detached);
        }

        self.subscriptions.close(timeout);
        self.publishers.text.close(timeout);
        if let Some(video) = &self.publishers.video {
            video.close(timeout);
        }
        if let Some(audio) = &self.publishers.audio {
            audio.close(timeout);
        }

        tracing::info!("Node on port {} stopped", self.channels.base_port());
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}
