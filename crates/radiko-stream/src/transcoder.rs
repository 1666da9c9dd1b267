//! One external ffmpeg process per stream.
//!
//! A `TranscoderProcess` owns the child, exposes stdout as the byte stream,
//! and forwards stderr lines to tracing.  `stop()` cancels, kills and reaps;
//! it is safe to call more than once.
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use radiko_proto::protocol::AUTH_TOKEN_HEADER;

use crate::error::{Result, StreamError};
use crate::resolver::ResolvedStream;

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// How the upstream is transcoded; chosen by the caller, never auto-detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeProfile {
    /// Raw s16le PCM for the local audio sink.
    Playback { sample_rate: u32, channels: u16 },
    /// ADTS stream copy for HTTP listeners.
    Relay,
    /// ADTS stream copy into a file.
    Record(PathBuf),
}

impl TranscodeProfile {
    /// ffmpeg argument list for this profile.
    pub fn args(&self, stream: &ResolvedStream) -> Vec<String> {
        let header = format!("{}: {}", AUTH_TOKEN_HEADER, stream.auth_token);
        let mut args: Vec<String> = vec!["-nostdin".into()];
        match self {
            TranscodeProfile::Playback {
                sample_rate,
                channels,
            } => {
                args.extend([
                    "-headers".into(),
                    header,
                    "-i".into(),
                    stream.stream_url.clone(),
                    "-f".into(),
                    "s16le".into(),
                    "-ar".into(),
                    sample_rate.to_string(),
                    "-ac".into(),
                    channels.to_string(),
                    "-loglevel".into(),
                    "error".into(),
                    "pipe:1".into(),
                ]);
            }
            TranscodeProfile::Relay => {
                args.extend(
                    [
                        "-reconnect",
                        "1",
                        "-reconnect_streamed",
                        "1",
                        "-reconnect_delay_max",
                        "10",
                        "-timeout",
                        "30000000",
                        "-headers",
                    ]
                    .map(String::from),
                );
                args.push(header);
                args.extend(["-i".into(), stream.stream_url.clone()]);
                args.extend(
                    [
                        "-c:a",
                        "copy",
                        "-f",
                        "adts",
                        "-fflags",
                        "+nobuffer+flush_packets",
                        "-flags",
                        "low_delay",
                        "-loglevel",
                        "warning",
                        "pipe:1",
                    ]
                    .map(String::from),
                );
            }
            TranscodeProfile::Record(path) => {
                args.extend([
                    "-headers".into(),
                    header,
                    "-i".into(),
                    stream.stream_url.clone(),
                    "-c:a".into(),
                    "copy".into(),
                    "-f".into(),
                    "adts".into(),
                    "-loglevel".into(),
                    "error".into(),
                    "-y".into(),
                    path.display().to_string(),
                ]);
            }
        }
        args
    }

    fn pipes_output(&self) -> bool {
        !matches!(self, TranscodeProfile::Record(_))
    }
}

/// A running (or stopped) transcoder.  Fakes are built with `from_reader`.
pub struct TranscoderProcess {
    id: u64,
    label: String,
    output: Option<ProcessOutput>,
    child: Option<Child>,
    cancel: CancellationToken,
    stopped: bool,
}

impl TranscoderProcess {
    fn from_child(label: &str, mut child: Child) -> Self {
        let output = child
            .stdout
            .take()
            .map(|out| Box::new(out) as ProcessOutput);
        let cancel = CancellationToken::new();
        if let Some(stderr) = child.stderr.take() {
            let label = label.to_string();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) if !line.trim().is_empty() => {
                                warn!(station = %label, "Transcoder stderr: {}", line.trim());
                            }
                            Ok(Some(_)) => {}
                            Ok(None) | Err(_) => break,
                        },
                    }
                }
            });
        }
        Self {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            label: label.to_string(),
            output,
            child: Some(child),
            cancel,
            stopped: false,
        }
    }

    /// In-memory process with no OS child; stopping only cancels.
    pub fn from_reader(label: &str, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            label: label.to_string(),
            output: Some(Box::new(reader)),
            child: None,
            cancel: CancellationToken::new(),
            stopped: false,
        }
    }

    /// Process identity; unique for the life of the program.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Primary output.  Can only be taken once.
    pub fn take_output(&mut self) -> Option<ProcessOutput> {
        self.output.take()
    }

    /// Fires when `stop()` begins; readers select on it to exit promptly.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        match self.child.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => !self.cancel.is_cancelled(),
        }
    }

    /// Cancel, kill and wait for exit.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.cancel.cancel();
        self.output = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("Failed to kill transcoder {} ({}): {}", self.id, self.label, e);
            }
        }
        debug!("Transcoder {} ({}) stopped", self.id, self.label);
    }
}

impl Drop for TranscoderProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts transcoder processes.  The session and player depend on this
/// instead of on ffmpeg directly.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(
        &self,
        label: &str,
        stream: &ResolvedStream,
        profile: &TranscodeProfile,
    ) -> Result<TranscoderProcess>;
}

/// Launches the real ffmpeg binary.
#[derive(Debug, Clone, Default)]
pub struct FfmpegLauncher {
    binary: Option<PathBuf>,
}

impl FfmpegLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary: Some(binary),
        }
    }

    fn binary(&self) -> Result<PathBuf> {
        self.binary
            .clone()
            .or_else(radiko_proto::platform::find_ffmpeg_binary)
            .ok_or(StreamError::TranscoderNotFound)
    }
}

#[async_trait]
impl ProcessLauncher for FfmpegLauncher {
    async fn launch(
        &self,
        label: &str,
        stream: &ResolvedStream,
        profile: &TranscodeProfile,
    ) -> Result<TranscoderProcess> {
        let binary = self.binary()?;
        let stdout = if profile.pipes_output() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let child = Command::new(&binary)
            .args(profile.args(stream))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StreamError::TranscoderNotFound,
                _ => StreamError::ProcessStart(format!("{}: {}", binary.display(), e)),
            })?;
        let process = TranscoderProcess::from_child(label, child);
        info!(
            "Started transcoder {} for {} ({:?})",
            process.id(),
            label,
            profile
        );
        Ok(process)
    }
}
