#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use radiko_stream::error::{ResolveError, Result, StreamError};
use radiko_stream::{
    ConsumerSink, ProcessLauncher, Reauthenticator, ResolvedStream, SessionSettings,
    TranscodeProfile, TranscoderProcess, UpstreamResolver,
};

/// Settings with a stall threshold long enough to never fire.
pub fn quiet_settings() -> SessionSettings {
    SessionSettings {
        grace_period: Duration::from_secs(10),
        write_timeout: Duration::from_secs(1),
        stall_threshold: Duration::from_secs(3600),
        stall_poll_interval: Duration::from_secs(2),
        broadcast_capacity: 100,
        read_chunk_bytes: 8192,
        max_reconnect_attempts: 3,
    }
}

pub fn stalling_settings() -> SessionSettings {
    SessionSettings {
        stall_threshold: Duration::from_secs(5),
        ..quiet_settings()
    }
}

// ── resolver ─────────────────────────────────────────────────────────────────

/// Counts calls; can be switched to fail.
#[derive(Default)]
pub struct FakeResolver {
    calls: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
}

impl FakeResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    async fn next_token(&self) -> std::result::Result<String, ResolveError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(ResolveError::AuthFailed("area not allowed".into()));
        }
        Ok(format!("tok-{}", n))
    }
}

#[async_trait]
impl UpstreamResolver for FakeResolver {
    async fn resolve(&self, station_id: &str) -> std::result::Result<ResolvedStream, ResolveError> {
        let auth_token = self.next_token().await?;
        Ok(ResolvedStream {
            auth_token,
            stream_url: format!("https://upstream.test/{}/playlist.m3u8", station_id),
        })
    }
}

#[async_trait]
impl Reauthenticator for FakeResolver {
    async fn reauthenticate(&self) -> std::result::Result<String, ResolveError> {
        self.next_token().await
    }
}

// ── launcher ─────────────────────────────────────────────────────────────────

/// One process handed out by `FakeLauncher`.
pub struct Launched {
    pub id: u64,
    pub label: String,
    pub auth_token: String,
    pub profile: TranscodeProfile,
    pub killed: CancellationToken,
    writer: tokio::sync::Mutex<Option<DuplexStream>>,
}

/// In-memory processes backed by `tokio::io::duplex`.
#[derive(Default)]
pub struct FakeLauncher {
    launched: Mutex<Vec<Arc<Launched>>>,
    overlap: AtomicBool,
    fail: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<Arc<Launched>> {
        self.launched.lock().unwrap().clone()
    }

    /// Launches excluding recordings.
    pub fn streams(&self) -> Vec<Arc<Launched>> {
        self.all()
            .into_iter()
            .filter(|l| !matches!(l.profile, TranscodeProfile::Record(_)))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.streams().len()
    }

    pub fn last(&self) -> Arc<Launched> {
        self.streams().last().cloned().expect("nothing launched")
    }

    /// True if a stream process was ever launched while another one for the
    /// same label was still alive.
    pub fn saw_overlap(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    pub fn alive(&self, label: &str) -> usize {
        self.streams()
            .iter()
            .filter(|l| l.label == label && !l.killed.is_cancelled())
            .count()
    }
}

impl Launched {
    pub async fn feed(&self, data: &[u8]) {
        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().expect("output already closed");
        w.write_all(data).await.expect("reader gone");
        w.flush().await.expect("flush");
    }

    /// Simulate the process closing its output.
    pub async fn close(&self) {
        self.writer.lock().await.take();
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(
        &self,
        label: &str,
        stream: &ResolvedStream,
        profile: &TranscodeProfile,
    ) -> Result<TranscoderProcess> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StreamError::ProcessStart("spawn refused".into()));
        }
        let is_stream = !matches!(profile, TranscodeProfile::Record(_));
        if is_stream && self.alive(label) > 0 {
            self.overlap.store(true, Ordering::SeqCst);
        }
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let process = TranscoderProcess::from_reader(label, reader);
        self.launched.lock().unwrap().push(Arc::new(Launched {
            id: process.id(),
            label: label.to_string(),
            auth_token: stream.auth_token.clone(),
            profile: profile.clone(),
            killed: process.cancellation(),
            writer: tokio::sync::Mutex::new(Some(writer)),
        }));
        Ok(process)
    }
}

// ── sinks ────────────────────────────────────────────────────────────────────

/// Forwards every chunk to an unbounded channel the test reads from.
pub struct CollectSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

pub fn collect_sink() -> (Box<dyn ConsumerSink>, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(CollectSink { tx }), rx)
}

#[async_trait]
impl ConsumerSink for CollectSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.tx
            .send(chunk)
            .map_err(|_| StreamError::ConsumerWrite("test receiver dropped".into()))
    }
}

/// Every write fails.
pub struct BrokenSink;

#[async_trait]
impl ConsumerSink for BrokenSink {
    async fn write(&mut self, _chunk: Bytes) -> Result<()> {
        Err(StreamError::ConsumerWrite("broken pipe".into()))
    }
}

/// Accepts and discards.
pub struct NullSink;

#[async_trait]
impl ConsumerSink for NullSink {
    async fn write(&mut self, _chunk: Bytes) -> Result<()> {
        Ok(())
    }
}

pub async fn next_chunk(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Bytes {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no chunk within 1s")
        .expect("sink channel closed")
}

/// Let spawned tasks run without moving the clock meaningfully.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
