//! Single-listener playback: one PCM transcoder feeding the local audio sink,
//! with volume, mute, recording and stall recovery on top.
//!
//! ```text
//!   run task (owns process + audio sink)
//!     ├── read s16le chunk ─► scale by effective volume ─► sink
//!     └── stall poll ─► Started ─► Authenticating ─► Resuming ─► Succeeded
//!                                                  └──────────► Failed (stop)
//! ```
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use radiko_proto::config::Config;
use radiko_proto::protocol::ReconnectStatus;

use crate::consumer::ConsumerSink;
use crate::error::{Result, StreamError};
use crate::recording::{Recorder, RecordingInfo};
use crate::resolver::{Reauthenticator, ResolvedStream};
use crate::transcoder::{ProcessLauncher, TranscodeProfile, TranscoderProcess};

const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub initial_volume: f64,
    pub stall_threshold: Duration,
    pub stall_poll_interval: Duration,
    pub recordings_dir: PathBuf,
}

impl PlaybackSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_rate: config.playback.sample_rate,
            channels: config.playback.channels,
            initial_volume: config.playback.default_volume.clamp(0.0, 1.0),
            stall_threshold: config.stream.stall_threshold(),
            stall_poll_interval: config.stream.stall_poll_interval(),
            recordings_dir: config.paths.recordings_dir.clone(),
        }
    }

    fn profile(&self) -> TranscodeProfile {
        TranscodeProfile::Playback {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }
}

/// Outcome of `toggle_recording`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingToggle {
    Started(PathBuf),
    Stopped(PathBuf),
}

/// Point-in-time view for the status line.
#[derive(Debug, Clone)]
pub struct PlayerSnapshot {
    pub station_id: Option<String>,
    pub volume: f64,
    pub muted: bool,
    pub effective_volume: f64,
    pub reconnect_status: ReconnectStatus,
    pub last_error: Option<String>,
    pub recording: Option<RecordingInfo>,
}

struct NowPlaying {
    station_id: String,
    stream: ResolvedStream,
    generation: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct PlayerState {
    volume: f64,
    muted: bool,
    volume_before_mute: f64,
    reconnect_status: ReconnectStatus,
    last_error: Option<String>,
    last_data: Instant,
    generation: u64,
    now_playing: Option<NowPlaying>,
}

struct Inner {
    settings: PlaybackSettings,
    reauth: Arc<dyn Reauthenticator>,
    launcher: Arc<dyn ProcessLauncher>,
    recorder: Recorder,
    state: Mutex<PlayerState>,
    status_tx: broadcast::Sender<ReconnectStatus>,
}

enum RunExit {
    Cancelled,
    Stall(Duration),
    SinkFailed(String),
}

#[derive(Clone)]
pub struct PlaybackController {
    inner: Arc<Inner>,
}

impl PlaybackController {
    pub fn new(
        settings: PlaybackSettings,
        reauth: Arc<dyn Reauthenticator>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(32);
        let volume = settings.initial_volume;
        let recorder = Recorder::new(launcher.clone(), settings.recordings_dir.clone());
        Self {
            inner: Arc::new(Inner {
                settings,
                reauth,
                launcher,
                recorder,
                state: Mutex::new(PlayerState {
                    volume,
                    muted: false,
                    volume_before_mute: volume,
                    reconnect_status: ReconnectStatus::None,
                    last_error: None,
                    last_data: Instant::now(),
                    generation: 0,
                    now_playing: None,
                }),
                status_tx,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PlayerState> {
        self.inner.state()
    }

    // ── playback ─────────────────────────────────────────────────────────────

    /// Start playing `stream` into `sink`.  Rejected while already playing.
    pub async fn play(
        &self,
        station_id: &str,
        stream: ResolvedStream,
        sink: Box<dyn ConsumerSink>,
    ) -> Result<()> {
        if self.is_playing() {
            return Err(StreamError::DuplicatePlay);
        }
        let process = self
            .inner
            .launcher
            .launch(station_id, &stream, &self.inner.settings.profile())
            .await?;

        // Another play may have won the race while we were launching.
        let rejected = {
            let mut st = self.state();
            if st.now_playing.is_some() {
                Some(process)
            } else {
                st.generation += 1;
                st.last_data = Instant::now();
                st.last_error = None;
                st.reconnect_status = ReconnectStatus::None;
                let generation = st.generation;
                let cancel = CancellationToken::new();
                let task = tokio::spawn(Inner::run(
                    self.inner.clone(),
                    generation,
                    process,
                    sink,
                    cancel.clone(),
                ));
                st.now_playing = Some(NowPlaying {
                    station_id: station_id.to_string(),
                    stream,
                    generation,
                    cancel,
                    task: Some(task),
                });
                None
            }
        };
        if let Some(mut process) = rejected {
            process.stop().await;
            return Err(StreamError::DuplicatePlay);
        }
        info!("Playing {}", station_id);
        Ok(())
    }

    /// Stop playback and wait for the transcoder to exit.  Recording is not
    /// touched.
    pub async fn stop(&self) -> Result<()> {
        let playing = self
            .state()
            .now_playing
            .take()
            .ok_or(StreamError::NotPlaying)?;
        playing.cancel.cancel();
        if let Some(task) = playing.task {
            if let Err(e) = task.await {
                warn!("Playback task ended abnormally: {}", e);
            }
        }
        info!("Stopped {}", playing.station_id);
        Ok(())
    }

    pub fn is_playing(&self) -> bool {
        self.state().now_playing.is_some()
    }

    pub fn current_station(&self) -> Option<String> {
        self.state()
            .now_playing
            .as_ref()
            .map(|p| p.station_id.clone())
    }

    /// Install a fresh token for the current stream (used after a station
    /// switch re-authenticates).
    pub fn update_auth_token(&self, token: &str) {
        if let Some(playing) = self.state().now_playing.as_mut() {
            playing.stream.auth_token = token.to_string();
        }
    }

    // ── volume ───────────────────────────────────────────────────────────────

    /// Set the stored volume; clears mute.  Returns the clamped value.
    pub fn set_volume(&self, volume: f64) -> f64 {
        let mut st = self.state();
        st.volume = volume.clamp(0.0, 1.0);
        st.muted = false;
        st.volume
    }

    pub fn increase_volume(&self, delta: f64) -> f64 {
        let current = self.volume();
        self.set_volume(current + delta.abs())
    }

    pub fn decrease_volume(&self, delta: f64) -> f64 {
        let current = self.volume();
        self.set_volume(current - delta.abs())
    }

    /// Returns true if now muted.
    pub fn toggle_mute(&self) -> bool {
        let mut st = self.state();
        if st.muted {
            st.muted = false;
            st.volume = st.volume_before_mute;
        } else {
            st.volume_before_mute = st.volume;
            st.muted = true;
        }
        st.muted
    }

    pub fn volume(&self) -> f64 {
        self.state().volume
    }

    pub fn is_muted(&self) -> bool {
        self.state().muted
    }

    /// What is applied to samples: 0 while muted, else the stored volume.
    pub fn effective_volume(&self) -> f64 {
        self.state().effective_volume()
    }

    // ── reconnect status ─────────────────────────────────────────────────────

    pub fn reconnect_status(&self) -> ReconnectStatus {
        self.state().reconnect_status
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    /// Acknowledge a finished reconnect (success or failure).
    pub fn clear_reconnect_status(&self) {
        let mut st = self.state();
        st.reconnect_status = ReconnectStatus::None;
        st.last_error = None;
    }

    /// Every reconnect status transition, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectStatus> {
        self.inner.status_tx.subscribe()
    }

    // ── recording ────────────────────────────────────────────────────────────

    /// Record the current stream.  Requires active playback.
    pub async fn start_recording(&self, label: &str) -> Result<PathBuf> {
        let stream = self
            .state()
            .now_playing
            .as_ref()
            .map(|p| p.stream.clone())
            .ok_or(StreamError::NotPlaying)?;
        self.inner.recorder.start(label, &stream).await
    }

    pub async fn stop_recording(&self) -> Result<PathBuf> {
        self.inner.recorder.stop().await
    }

    pub async fn toggle_recording(&self, label: &str) -> Result<RecordingToggle> {
        if self.inner.recorder.is_recording().await {
            self.stop_recording().await.map(RecordingToggle::Stopped)
        } else {
            self.start_recording(label).await.map(RecordingToggle::Started)
        }
    }

    pub async fn recording_info(&self) -> Option<RecordingInfo> {
        self.inner.recorder.info().await
    }

    pub async fn snapshot(&self) -> PlayerSnapshot {
        let recording = self.recording_info().await;
        let st = self.state();
        PlayerSnapshot {
            station_id: st.now_playing.as_ref().map(|p| p.station_id.clone()),
            volume: st.volume,
            muted: st.muted,
            effective_volume: st.effective_volume(),
            reconnect_status: st.reconnect_status,
            last_error: st.last_error.clone(),
            recording,
        }
    }
}

impl PlayerState {
    fn effective_volume(&self) -> f64 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, PlayerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_status(&self, status: ReconnectStatus) {
        self.state().reconnect_status = status;
        if let Some(label) = status.label() {
            info!("Playback status: {}", label);
        }
        let _ = self.status_tx.send(status);
    }

    fn current_stream(&self, generation: u64) -> Option<(String, ResolvedStream)> {
        self.state()
            .now_playing
            .as_ref()
            .filter(|p| p.generation == generation)
            .map(|p| (p.station_id.clone(), p.stream.clone()))
    }

    /// Owns the process and the sink for one play request.
    async fn run(
        self: Arc<Self>,
        generation: u64,
        mut process: TranscoderProcess,
        mut sink: Box<dyn ConsumerSink>,
        cancel: CancellationToken,
    ) {
        loop {
            let exit = self.pump(&mut process, sink.as_mut(), &cancel).await;
            process.stop().await;
            match exit {
                RunExit::Cancelled => break,
                RunExit::SinkFailed(e) => {
                    error!("Audio output failed: {}", e);
                    self.state().last_error = Some(e);
                    break;
                }
                RunExit::Stall(silent) => {
                    warn!("Playback stalled: {}", StreamError::Stall(silent));
                    match self.reconnect(generation, &cancel).await {
                        Ok(Some(next)) => process = next,
                        Ok(None) => break,
                        Err(e) => {
                            let reason = e.to_string();
                            error!("Reconnect failed: {}", reason);
                            self.state().last_error = Some(reason);
                            self.set_status(ReconnectStatus::Failed);
                            break;
                        }
                    }
                }
            }
        }

        let mut st = self.state();
        if st
            .now_playing
            .as_ref()
            .is_some_and(|p| p.generation == generation)
        {
            st.now_playing = None;
        }
        debug!("Playback task {} finished", generation);
    }

    /// Read, scale and write until cancelled, stalled or the sink fails.
    /// End-of-stream is not an exit; silence is left to the stall poll.
    async fn pump(
        &self,
        process: &mut TranscoderProcess,
        sink: &mut dyn ConsumerSink,
        cancel: &CancellationToken,
    ) -> RunExit {
        let mut output = process.take_output();
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        let mut scaler = PcmScaler::default();
        let mut poll = tokio::time::interval(self.settings.stall_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        poll.tick().await;
        self.state().last_data = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return RunExit::Cancelled,
                _ = poll.tick() => {
                    let silent = self.state().last_data.elapsed();
                    if silent > self.settings.stall_threshold {
                        return RunExit::Stall(silent);
                    }
                }
                read = read_some(&mut output, &mut buf) => match read {
                    Some(n) => {
                        let volume = {
                            let mut st = self.state();
                            st.last_data = Instant::now();
                            st.effective_volume()
                        };
                        let pcm = scaler.process(&buf[..n], volume);
                        if pcm.is_empty() {
                            continue;
                        }
                        if let Err(e) = sink.write(Bytes::from(pcm)).await {
                            return RunExit::SinkFailed(e.to_string());
                        }
                    }
                    None => {
                        debug!("Transcoder output closed");
                        output = None;
                    }
                },
            }
        }
    }

    /// Started -> Authenticating -> Resuming -> Succeeded.  `Ok(None)` when
    /// cancelled part way.
    async fn reconnect(
        &self,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<TranscoderProcess>> {
        self.set_status(ReconnectStatus::Started);
        let attempt = async {
            tokio::time::sleep(RECONNECT_BACKOFF).await;

            self.set_status(ReconnectStatus::Authenticating);
            let token = self.reauth.reauthenticate().await?;
            let (station_id, mut stream) = self
                .current_stream(generation)
                .ok_or(StreamError::NotPlaying)?;
            stream.auth_token = token;
            if let Some(playing) = self.state().now_playing.as_mut() {
                if playing.generation == generation {
                    playing.stream = stream.clone();
                }
            }

            self.set_status(ReconnectStatus::Resuming);
            self.launcher
                .launch(&station_id, &stream, &self.settings.profile())
                .await
        };
        let process = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            res = attempt => res?,
        };
        if cancel.is_cancelled() {
            let mut process = process;
            process.stop().await;
            return Ok(None);
        }
        {
            let mut st = self.state();
            st.last_error = None;
            st.last_data = Instant::now();
        }
        self.set_status(ReconnectStatus::Succeeded);
        Ok(Some(process))
    }
}

/// Read into `buf`; `None` on EOF or error.  Pends forever without output so
/// the stall poll stays in charge.
async fn read_some(
    output: &mut Option<crate::transcoder::ProcessOutput>,
    buf: &mut [u8],
) -> Option<usize> {
    match output.as_mut() {
        Some(out) => match out.read(buf).await {
            Ok(0) => None,
            Ok(n) => Some(n),
            Err(e) => {
                debug!("Transcoder read error: {}", e);
                None
            }
        },
        None => std::future::pending().await,
    }
}

/// Applies a gain to s16le PCM, carrying an odd trailing byte to the next
/// chunk so samples are never split.
#[derive(Debug, Default)]
pub struct PcmScaler {
    carry: Option<u8>,
}

impl PcmScaler {
    pub fn process(&mut self, chunk: &[u8], volume: f64) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(chunk.len() + 1);
        if let Some(b) = self.carry.take() {
            pcm.push(b);
        }
        pcm.extend_from_slice(chunk);
        if pcm.len() % 2 == 1 {
            self.carry = pcm.pop();
        }
        scale_pcm_s16le(&mut pcm, volume);
        pcm
    }
}

/// Multiply every little-endian i16 sample in place.  A trailing odd byte is
/// left untouched.
pub fn scale_pcm_s16le(pcm: &mut [u8], volume: f64) {
    let volume = volume.clamp(0.0, 1.0);
    if (volume - 1.0).abs() < f64::EPSILON {
        return;
    }
    for pair in pcm.chunks_exact_mut(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        let scaled = (f64::from(sample) * volume)
            .round()
            .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
        pair.copy_from_slice(&scaled.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn scaling_halves_samples() {
        let mut pcm = samples(&[1000, -1000, i16::MAX, i16::MIN]);
        scale_pcm_s16le(&mut pcm, 0.5);
        assert_eq!(pcm, samples(&[500, -500, 16384, -16384]));
    }

    #[test]
    fn zero_volume_silences_and_unity_is_identity() {
        let mut pcm = samples(&[1234, -4321]);
        scale_pcm_s16le(&mut pcm, 1.0);
        assert_eq!(pcm, samples(&[1234, -4321]));
        scale_pcm_s16le(&mut pcm, 0.0);
        assert_eq!(pcm, samples(&[0, 0]));
    }

    #[test]
    fn scaler_carries_split_samples() {
        let bytes = samples(&[200, 400]);
        let mut scaler = PcmScaler::default();
        let first = scaler.process(&bytes[..3], 0.5);
        let second = scaler.process(&bytes[3..], 0.5);
        assert_eq!(first, samples(&[100]));
        assert_eq!(second, samples(&[200]));
    }
}
