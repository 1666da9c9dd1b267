//! Local audio output: raw s16le piped into `ffplay`.
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info};

use radiko_stream::{ConsumerSink, Result as StreamResult, StreamError};

/// Plays PCM written to it.  The ffplay child is killed on drop.
pub struct FfplaySink {
    child: Child,
    stdin: ChildStdin,
}

impl FfplaySink {
    pub fn open(sample_rate: u32, channels: u16) -> anyhow::Result<Self> {
        let binary = radiko_proto::platform::find_ffplay_binary()
            .context("ffplay not found (set FFPLAY_PATH or install ffmpeg)")?;
        let mut child = Command::new(&binary)
            .args(ffplay_args(sample_rate, channels))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", binary.display()))?;
        let stdin = child.stdin.take().context("ffplay stdin unavailable")?;
        info!(
            "Audio output open via ffplay ({} Hz, {} ch)",
            sample_rate, channels
        );
        Ok(Self { child, stdin })
    }
}

impl Drop for FfplaySink {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("ffplay already gone: {}", e);
        }
    }
}

#[async_trait]
impl ConsumerSink for FfplaySink {
    async fn write(&mut self, chunk: Bytes) -> StreamResult<()> {
        self.stdin
            .write_all(&chunk)
            .await
            .map_err(|e| StreamError::ConsumerWrite(format!("audio output: {}", e)))
    }
}

fn channel_layout(channels: u16) -> String {
    match channels {
        1 => "mono".to_string(),
        2 => "stereo".to_string(),
        n => format!("{}c", n),
    }
}

pub fn ffplay_args(sample_rate: u32, channels: u16) -> Vec<String> {
    vec![
        "-nodisp".into(),
        "-autoexit".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "s16le".into(),
        "-ar".into(),
        sample_rate.to_string(),
        "-ch_layout".into(),
        channel_layout(channels),
        "-i".into(),
        "-".into(),
    ]
}
