//! Error types for upstream resolution and stream sessions.

use std::time::Duration;

/// Failures while turning a station id into an auth token + stream URL.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("upstream response missing header {0}")]
    MissingHeader(&'static str),

    #[error("no stream URL found for station {0}")]
    NoStreamUrl(String),

    #[error("malformed upstream XML: {0}")]
    Xml(String),
}

impl From<quick_xml::Error> for ResolveError {
    fn from(e: quick_xml::Error) -> Self {
        ResolveError::Xml(e.to_string())
    }
}

/// Errors surfaced by sessions, the registry and the playback controller.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Auth failure, missing stream URL or upstream HTTP failure.
    #[error("resolution failed: {0}")]
    Resolution(#[from] ResolveError),

    #[error("transcoder binary (ffmpeg) not found on PATH")]
    TranscoderNotFound,

    #[error("failed to start transcoder: {0}")]
    ProcessStart(String),

    #[error("no data received for {0:?}")]
    Stall(Duration),

    #[error("consumer write failed: {0}")]
    ConsumerWrite(String),

    #[error("already playing")]
    DuplicatePlay,

    #[error("not playing")]
    NotPlaying,

    #[error("already recording")]
    AlreadyRecording,

    #[error("not recording")]
    NotRecording,

    /// The session finished between lookup and attach; callers retry.
    #[error("session for station {0} has stopped")]
    SessionStopped(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;
