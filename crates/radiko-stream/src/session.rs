//! One live relay pipeline per station, shared by every attached consumer.
//!
//! ```text
//!   supervisor task (owns TranscoderProcess)
//!     ├── reads process output ──► broadcast (bounded, drops oldest)
//!     ├── stall poll on an interval
//!     └── on stall / EOF: stop old process, re-resolve, relaunch
//!
//!   dispatcher task
//!     └── broadcast rx ──► try_send into each consumer's outbox (never waits)
//!
//!   writer task (one per consumer)
//!     └── outbox ──► sink write under timeout ──► failure: detach that one
//!
//!   idle timer (armed at start and when the last consumer leaves)
//!     └── grace elapsed with zero consumers ──► stop
//! ```
//!
//! The consumer map, phase and idle timer live behind one mutex; the timer,
//! the dispatcher and attach/detach all go through it.  The release hook runs
//! only after the supervisor has reaped the transcoder, so a replacement
//! session never overlaps the old process.
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use radiko_proto::config::Config;
use radiko_proto::protocol::{SessionPhase, StationStatus};

use crate::consumer::{Consumer, ConsumerId};
use crate::error::{Result, StreamError};
use crate::resolver::UpstreamResolver;
use crate::transcoder::{ProcessLauncher, TranscodeProfile, TranscoderProcess};

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Pause between stopping a dead process and resolving again.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Timing and buffering knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub grace_period: Duration,
    pub write_timeout: Duration,
    pub stall_threshold: Duration,
    pub stall_poll_interval: Duration,
    pub broadcast_capacity: usize,
    pub read_chunk_bytes: usize,
    pub max_reconnect_attempts: u32,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            grace_period: config.server.grace_period(),
            write_timeout: config.server.consumer_write_timeout(),
            stall_threshold: config.stream.stall_threshold(),
            stall_poll_interval: config.stream.stall_poll_interval(),
            broadcast_capacity: config.stream.broadcast_capacity.max(1),
            read_chunk_bytes: config.stream.read_chunk_bytes.max(1),
            max_reconnect_attempts: config.stream.max_reconnect_attempts,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Called once after a stopped session's transcoder has been reaped.
pub type ReleaseHook = Box<dyn FnOnce(&StationSession) + Send>;

/// A consumer plus the queue its writer task drains.
struct Attached {
    consumer: Arc<Consumer>,
    outbox: mpsc::Sender<Bytes>,
}

struct State {
    phase: SessionPhase,
    consumers: HashMap<ConsumerId, Attached>,
    idle_timer: Option<AbortHandle>,
    /// Bumped on every arm/cancel so a stale timer can tell it lost.
    idle_generation: u64,
    process_id: Option<u64>,
    last_data: Instant,
    last_error: Option<String>,
}

struct Inner {
    station_id: String,
    epoch: u64,
    settings: SessionSettings,
    resolver: Arc<dyn UpstreamResolver>,
    launcher: Arc<dyn ProcessLauncher>,
    state: Mutex<State>,
    chunks: broadcast::Sender<Bytes>,
    shutdown: CancellationToken,
    finished: CancellationToken,
    on_release: Mutex<Option<ReleaseHook>>,
}

/// Why the read loop for one process ended.
enum PumpExit {
    Shutdown,
    EndOfStream,
    ReadError(String),
    Stall(Duration),
    NoOutput,
}

impl std::fmt::Display for PumpExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpExit::Shutdown => write!(f, "shutdown"),
            PumpExit::EndOfStream => write!(f, "transcoder output ended"),
            PumpExit::ReadError(e) => write!(f, "read error: {}", e),
            PumpExit::Stall(d) => write!(f, "{}", StreamError::Stall(*d)),
            PumpExit::NoOutput => write!(f, "transcoder has no output"),
        }
    }
}

/// Cheap-to-clone handle to a live station pipeline.
#[derive(Clone)]
pub struct StationSession {
    inner: Arc<Inner>,
}

impl StationSession {
    /// Resolve upstream, launch the relay process and start the pipeline.
    ///
    /// On error nothing is left running.  The returned session has no
    /// consumers and its idle timer is already armed; the first attach
    /// cancels it.
    pub async fn start(
        station_id: &str,
        settings: SessionSettings,
        resolver: Arc<dyn UpstreamResolver>,
        launcher: Arc<dyn ProcessLauncher>,
        on_release: Option<ReleaseHook>,
    ) -> Result<StationSession> {
        info!("Starting session {}", station_id);
        let resolved = resolver.resolve(station_id).await?;
        let process = launcher
            .launch(station_id, &resolved, &TranscodeProfile::Relay)
            .await?;

        let (chunks, rx) = broadcast::channel(settings.broadcast_capacity.max(1));
        let session = StationSession {
            inner: Arc::new(Inner {
                station_id: station_id.to_string(),
                epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
                settings,
                resolver,
                launcher,
                state: Mutex::new(State {
                    phase: SessionPhase::Draining,
                    consumers: HashMap::new(),
                    idle_timer: None,
                    idle_generation: 0,
                    process_id: Some(process.id()),
                    last_data: Instant::now(),
                    last_error: None,
                }),
                chunks,
                shutdown: CancellationToken::new(),
                finished: CancellationToken::new(),
                on_release: Mutex::new(on_release),
            }),
        };

        {
            let mut st = session.state();
            session.arm_idle_timer(&mut st);
        }
        tokio::spawn(session.clone().dispatch(rx));
        tokio::spawn(session.clone().supervise(process));
        info!(
            "Session {} running (epoch {})",
            session.station_id(),
            session.epoch()
        );
        Ok(session)
    }

    pub fn station_id(&self) -> &str {
        &self.inner.station_id
    }

    /// Unique per session object; a recreated session gets a new epoch.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    pub fn same_session(&self, other: &StationSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn phase(&self) -> SessionPhase {
        self.state().phase
    }

    pub fn is_alive(&self) -> bool {
        self.phase().is_alive()
    }

    /// Id of the current transcoder, `None` between processes or once stopped.
    pub fn process_id(&self) -> Option<u64> {
        self.state().process_id
    }

    pub fn consumer_count(&self) -> usize {
        self.state().consumers.len()
    }

    pub fn has_idle_timer(&self) -> bool {
        self.state().idle_timer.is_some()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn status(&self) -> StationStatus {
        let st = self.state();
        StationStatus {
            consumer_count: st.consumers.len(),
            running: st.phase.is_alive() && st.process_id.is_some(),
        }
    }

    /// Add a consumer, cancelling any pending idle shutdown.  The consumer
    /// gets its own writer task, so a slow sink only ever delays itself.
    pub fn attach(&self, consumer: Arc<Consumer>) -> Result<()> {
        let mut st = self.state();
        if !st.phase.is_alive() {
            return Err(StreamError::SessionStopped(self.inner.station_id.clone()));
        }
        if let Some(timer) = st.idle_timer.take() {
            timer.abort();
            st.idle_generation += 1;
            info!(
                "Session {} idle timer cancelled, reusing process {:?}",
                self.inner.station_id, st.process_id
            );
        }
        if st.phase == SessionPhase::Draining {
            st.phase = SessionPhase::Running;
        }
        debug!(
            "Session {} attached {} ({} total)",
            self.inner.station_id,
            consumer.id(),
            st.consumers.len() + 1
        );
        let (outbox, queue) = mpsc::channel(self.inner.settings.broadcast_capacity.max(1));
        tokio::spawn(self.clone().write_loop(consumer.clone(), queue));
        st.consumers
            .insert(consumer.id().clone(), Attached { consumer, outbox });
        Ok(())
    }

    /// Remove a consumer.  Idempotent; the last one out arms the idle timer.
    pub fn detach(&self, id: &ConsumerId) {
        let mut st = self.state();
        let Some(attached) = st.consumers.remove(id) else {
            return;
        };
        attached.consumer.liveness().signal();
        debug!(
            "Session {} detached {} ({} left)",
            self.inner.station_id,
            id,
            st.consumers.len()
        );
        if st.consumers.is_empty() && st.phase.is_alive() {
            if st.phase == SessionPhase::Running {
                st.phase = SessionPhase::Draining;
            }
            self.arm_idle_timer(&mut st);
        }
    }

    /// Block until the consumer disconnects or is dropped by the session,
    /// then detach it.
    pub async fn serve_consumer(
        &self,
        consumer: Arc<Consumer>,
        disconnected: impl Future<Output = ()>,
    ) {
        tokio::select! {
            _ = consumer.liveness().signalled() => {}
            _ = disconnected => {
                debug!("Session {} consumer {} disconnected", self.inner.station_id, consumer.id());
            }
        }
        self.detach(consumer.id());
    }

    /// Stop the session: consumers are released and the supervisor kills
    /// the process, then runs the release hook.  No-op when already stopped.
    pub fn stop(&self) {
        let released = {
            let mut st = self.state();
            Self::stop_locked(&mut st)
        };
        if let Some(consumers) = released {
            self.finish_stop(consumers);
        }
    }

    /// The `Stopped` transition itself.  Callers hold the state lock, so a
    /// check made under the same hold cannot be raced by `attach`.
    fn stop_locked(st: &mut State) -> Option<Vec<Arc<Consumer>>> {
        if !st.phase.is_alive() {
            return None;
        }
        st.phase = SessionPhase::Stopped;
        if let Some(timer) = st.idle_timer.take() {
            timer.abort();
        }
        st.idle_generation += 1;
        st.process_id = None;
        Some(st.consumers.drain().map(|(_, a)| a.consumer).collect())
    }

    fn finish_stop(&self, consumers: Vec<Arc<Consumer>>) {
        for consumer in &consumers {
            consumer.liveness().signal();
        }
        self.inner.shutdown.cancel();
        info!(
            "Session {} stopped ({} consumers released)",
            self.inner.station_id,
            consumers.len()
        );
    }

    fn run_release_hook(&self) {
        let hook = self
            .inner
            .on_release
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Resolves once the transcoder of a stopped session has been reaped.
    pub async fn finished(&self) {
        self.inner.finished.cancelled().await
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    fn fail(&self, reason: String) {
        error!("Session {} failed: {}", self.inner.station_id, reason);
        self.state().last_error = Some(reason);
        self.stop();
    }

    fn arm_idle_timer(&self, st: &mut State) {
        if let Some(old) = st.idle_timer.take() {
            old.abort();
        }
        st.idle_generation += 1;
        let generation = st.idle_generation;
        let grace = self.inner.settings.grace_period;
        let session = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            session.idle_expired(generation);
        });
        st.idle_timer = Some(handle.abort_handle());
        info!(
            "Session {} has no consumers, stopping in {:?} unless one attaches",
            self.inner.station_id, grace
        );
    }

    fn idle_expired(&self, generation: u64) {
        let released = {
            let mut st = self.state();
            if st.idle_generation != generation || !st.consumers.is_empty() {
                return;
            }
            st.idle_timer = None;
            Self::stop_locked(&mut st)
        };
        if let Some(consumers) = released {
            info!("Session {} grace period elapsed", self.inner.station_id);
            self.finish_stop(consumers);
        }
    }

    fn touch(&self) {
        self.state().last_data = Instant::now();
    }

    fn silent_for(&self) -> Duration {
        self.state().last_data.elapsed()
    }

    /// Owns the process.  Runs until shutdown or an unrecoverable failure.
    async fn supervise(self, mut process: TranscoderProcess) {
        let mut failures = 0u32;
        loop {
            let (exit, got_data) = self.pump(&mut process).await;
            process.stop().await;
            self.state().process_id = None;

            if matches!(exit, PumpExit::Shutdown) || self.inner.shutdown.is_cancelled() {
                break;
            }
            if got_data {
                failures = 0;
            }
            failures += 1;
            if failures > self.inner.settings.max_reconnect_attempts {
                self.fail(format!(
                    "{} ({} reconnect attempts exhausted)",
                    exit, self.inner.settings.max_reconnect_attempts
                ));
                break;
            }

            warn!(
                "Session {} {}; reconnecting (attempt {})",
                self.inner.station_id, exit, failures
            );
            {
                let mut st = self.state();
                if st.phase.is_alive() {
                    st.phase = SessionPhase::Starting;
                }
            }
            match self.relaunch().await {
                Ok(Some(next)) => {
                    process = next;
                    let mut st = self.state();
                    st.process_id = Some(process.id());
                    st.last_data = Instant::now();
                    if st.phase == SessionPhase::Starting {
                        st.phase = if st.idle_timer.is_some() {
                            SessionPhase::Draining
                        } else {
                            SessionPhase::Running
                        };
                    }
                    info!(
                        "Session {} reconnected with process {}",
                        self.inner.station_id,
                        process.id()
                    );
                }
                Ok(None) => break,
                Err(e) => {
                    self.fail(format!("reconnect failed: {}", e));
                    break;
                }
            }
        }
        self.run_release_hook();
        self.inner.finished.cancel();
    }

    /// New token + URL and a new process.  `Ok(None)` if stopped meanwhile.
    async fn relaunch(&self) -> Result<Option<TranscoderProcess>> {
        let shutdown = self.inner.shutdown.clone();
        let station = self.inner.station_id.as_str();
        let attempt = async {
            tokio::time::sleep(RECONNECT_BACKOFF).await;
            let resolved = self.inner.resolver.resolve(station).await?;
            self.inner
                .launcher
                .launch(station, &resolved, &TranscodeProfile::Relay)
                .await
        };
        tokio::select! {
            _ = shutdown.cancelled() => Ok(None),
            res = attempt => match res {
                Ok(mut process) if shutdown.is_cancelled() => {
                    process.stop().await;
                    Ok(None)
                }
                Ok(process) => Ok(Some(process)),
                Err(e) => Err(e),
            },
        }
    }

    /// Read one process until it ends, stalls or the session shuts down.
    async fn pump(&self, process: &mut TranscoderProcess) -> (PumpExit, bool) {
        let Some(mut output) = process.take_output() else {
            return (PumpExit::NoOutput, false);
        };
        let process_cancel = process.cancellation();
        let settings = &self.inner.settings;
        let mut buf = vec![0u8; settings.read_chunk_bytes.max(1)];
        let mut poll = tokio::time::interval(settings.stall_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        poll.tick().await;
        self.touch();
        let mut got_data = false;

        let exit = loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break PumpExit::Shutdown,
                _ = process_cancel.cancelled() => break PumpExit::EndOfStream,
                _ = poll.tick() => {
                    let silent = self.silent_for();
                    if silent > settings.stall_threshold {
                        break PumpExit::Stall(silent);
                    }
                }
                read = output.read(&mut buf) => match read {
                    Ok(0) => break PumpExit::EndOfStream,
                    Ok(n) => {
                        got_data = true;
                        self.touch();
                        // Err only means no receiver; the dispatcher is gone on shutdown.
                        let _ = self.inner.chunks.send(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(e) => break PumpExit::ReadError(e.to_string()),
                },
            }
        };
        (exit, got_data)
    }

    /// Hand each chunk to every consumer's outbox without waiting.  A full
    /// outbox means that consumer is behind; it misses this chunk.
    async fn dispatch(self, mut rx: broadcast::Receiver<Bytes>) {
        loop {
            let chunk = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                recv = rx.recv() => match recv {
                    Ok(chunk) => chunk,
                    Err(RecvError::Lagged(n)) => {
                        debug!("Session {} dropped {} oldest chunks", self.inner.station_id, n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let closed: Vec<ConsumerId> = {
                let st = self.state();
                st.consumers
                    .iter()
                    .filter_map(|(id, attached)| match attached.outbox.try_send(chunk.clone()) {
                        Ok(()) => None,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("Session {} consumer {} is behind, skipping a chunk", self.inner.station_id, id);
                            None
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => Some(id.clone()),
                    })
                    .collect()
            };
            for id in &closed {
                self.detach(id);
            }
        }
        debug!("Session {} dispatcher finished", self.inner.station_id);
    }

    /// Drain one consumer's outbox into its sink.  Ends when the consumer is
    /// detached, its liveness fires or a write fails.
    async fn write_loop(self, consumer: Arc<Consumer>, mut queue: mpsc::Receiver<Bytes>) {
        let timeout = self.inner.settings.write_timeout;
        loop {
            let chunk = tokio::select! {
                _ = consumer.liveness().signalled() => break,
                chunk = queue.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            if let Err(e) = consumer.deliver(chunk, timeout).await {
                warn!(
                    "Dropping consumer {} from {}: {}",
                    consumer.id(),
                    self.inner.station_id,
                    e
                );
                break;
            }
        }
        self.detach(consumer.id());
    }
}

impl std::fmt::Debug for StationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationSession")
            .field("station_id", &self.inner.station_id)
            .field("epoch", &self.inner.epoch)
            .field("phase", &self.phase())
            .finish()
    }
}
