//! Media subsystem
//!
//! Capture sources, the frame codec, output sinks and the ingress buffers
//! that sit between the network and the consumers.

pub mod buffer;
pub mod codec;
pub mod sink;
pub mod source;

pub use buffer::{BufferStats, IngressBuffer, SharedBuffer};
pub use codec::{FrameCodec, RawFrameCodec};
pub use sink::{AudioOutput, DisplayControl, LogDisplay, LogSpeaker, TextSink, VideoDisplay};
pub use source::{AudioSource, PatternSource, ToneSource, VideoSource};
