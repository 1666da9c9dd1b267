//! Stream-copy recording to a timestamped file.
//!
//! A recording runs its own transcoder, separate from playback: stopping or
//! reconnecting playback leaves it alone and vice versa.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Result, StreamError};
use crate::resolver::ResolvedStream;
use crate::transcoder::{ProcessLauncher, TranscodeProfile, TranscoderProcess};

/// What is being recorded right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingInfo {
    pub path: PathBuf,
    pub label: String,
    pub started_at: DateTime<Local>,
}

impl RecordingInfo {
    pub fn elapsed(&self) -> Duration {
        (Local::now() - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

struct ActiveRecording {
    process: TranscoderProcess,
    info: RecordingInfo,
}

pub struct Recorder {
    launcher: Arc<dyn ProcessLauncher>,
    dir: PathBuf,
    active: Mutex<Option<ActiveRecording>>,
}

impl Recorder {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, dir: PathBuf) -> Self {
        Self {
            launcher,
            dir,
            active: Mutex::new(None),
        }
    }

    pub async fn info(&self) -> Option<RecordingInfo> {
        self.active.lock().await.as_ref().map(|a| a.info.clone())
    }

    pub async fn is_recording(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Start recording `stream` into `<dir>/radiko_<label>_<timestamp>.aac`.
    pub async fn start(&self, label: &str, stream: &ResolvedStream) -> Result<PathBuf> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(StreamError::AlreadyRecording);
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let started_at = Local::now();
        let path = self.dir.join(recording_file_name(label, &started_at));
        let process = self
            .launcher
            .launch(label, stream, &TranscodeProfile::Record(path.clone()))
            .await?;
        info!("Recording {} to {}", label, path.display());
        *active = Some(ActiveRecording {
            process,
            info: RecordingInfo {
                path: path.clone(),
                label: label.to_string(),
                started_at,
            },
        });
        Ok(path)
    }

    /// Stop the current recording and return its file.
    pub async fn stop(&self) -> Result<PathBuf> {
        let mut active = self.active.lock().await;
        let Some(mut recording) = active.take() else {
            return Err(StreamError::NotRecording);
        };
        recording.process.stop().await;
        let elapsed = recording.info.elapsed();
        info!(
            "Recording saved to {} ({}s)",
            recording.info.path.display(),
            elapsed.as_secs()
        );
        if !recording.info.path.exists() {
            warn!("Recording {} was never written", recording.info.path.display());
        }
        Ok(recording.info.path)
    }
}

/// Replace path-unsafe characters and spaces with `_`.
pub fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
            c => c,
        })
        .collect()
}

pub fn recording_file_name(label: &str, at: &DateTime<Local>) -> String {
    format!(
        "radiko_{}_{}.aac",
        sanitize_label(label),
        at.format("%Y%m%d_%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;

    #[test]
    fn sanitizes_unsafe_characters() {
        assert_eq!(sanitize_label(r#"a/b\c:d*e?f"g<h>i|j k"#), "a_b_c_d_e_f_g_h_i_j_k");
        assert_eq!(sanitize_label("TBSラジオ"), "TBSラジオ");
    }

    #[test]
    fn file_name_is_timestamped() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            recording_file_name("QRR Live", &at),
            "radiko_QRR_Live_20240309_070501.aac"
        );
    }

    struct NullLauncher;

    #[async_trait]
    impl ProcessLauncher for NullLauncher {
        async fn launch(
            &self,
            label: &str,
            _stream: &ResolvedStream,
            profile: &TranscodeProfile,
        ) -> Result<TranscoderProcess> {
            assert!(matches!(profile, TranscodeProfile::Record(_)));
            Ok(TranscoderProcess::from_reader(label, tokio::io::empty()))
        }
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_stop_requires_active() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(Arc::new(NullLauncher), dir.path().join("rec"));
        let stream = ResolvedStream {
            auth_token: "t".into(),
            stream_url: "u".into(),
        };

        assert!(matches!(recorder.stop().await, Err(StreamError::NotRecording)));
        let path = recorder.start("QRR", &stream).await.unwrap();
        assert!(path.starts_with(dir.path().join("rec")));
        assert!(recorder.is_recording().await);
        assert!(matches!(
            recorder.start("QRR", &stream).await,
            Err(StreamError::AlreadyRecording)
        ));
        assert_eq!(recorder.info().await.unwrap().label, "QRR");
        assert_eq!(recorder.stop().await.unwrap(), path);
        assert!(recorder.info().await.is_none());
    }
}
