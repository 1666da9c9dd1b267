//! Station sessions, multi-listener fan-out and local playback control.
pub mod consumer;
pub mod error;
pub mod playback;
pub mod recording;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod transcoder;

pub use consumer::{ChannelSink, Consumer, ConsumerId, ConsumerSink, Liveness};
pub use error::{ResolveError, Result, StreamError};
pub use playback::{PlaybackController, PlaybackSettings, RecordingToggle};
pub use registry::SessionRegistry;
pub use resolver::{RadikoResolver, Reauthenticator, ResolvedStream, UpstreamResolver};
pub use session::{SessionSettings, StationSession};
pub use transcoder::{FfmpegLauncher, ProcessLauncher, TranscodeProfile, TranscoderProcess};
