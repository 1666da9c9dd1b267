//! Station id -> live session.
//!
//! The map lock is only held for check-and-insert of a per-station slot.
//! Resolution and process start run under that slot's async creation lock,
//! so concurrent first listeners for one station trigger exactly one start.
//! A stopped session stays in its slot until its transcoder is reaped.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info};

use radiko_proto::protocol::StatusReport;

use crate::consumer::{Consumer, ConsumerId, ConsumerSink, Liveness};
use crate::error::{Result, StreamError};
use crate::resolver::UpstreamResolver;
use crate::session::{ReleaseHook, SessionSettings, StationSession};
use crate::transcoder::ProcessLauncher;

/// How many times an attach chases a session that stopped under it.
const ATTACH_RETRIES: usize = 3;

#[derive(Default)]
struct Slot {
    create_lock: tokio::sync::Mutex<()>,
    session: Mutex<Option<StationSession>>,
}

impl Slot {
    fn current(&self) -> Option<StationSession> {
        self.session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set(&self, session: Option<StationSession>) {
        *self.session.lock().unwrap_or_else(|p| p.into_inner()) = session;
    }
}

struct RegistryInner {
    settings: SessionSettings,
    resolver: Arc<dyn UpstreamResolver>,
    launcher: Arc<dyn ProcessLauncher>,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl RegistryInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop the mapping for `session`, but only if it is still the one
    /// registered.  A newer session for the same station is left alone.
    fn release(&self, session: &StationSession) {
        let station = session.station_id();
        let mut slots = self.slots();
        let Some(slot) = slots.get(station).cloned() else {
            return;
        };
        let same = slot
            .current()
            .is_some_and(|current| current.same_session(session));
        if !same {
            debug!(
                "Session {} epoch {} already replaced",
                station,
                session.epoch()
            );
            return;
        }
        slot.set(None);
        // A creator holding the lock will fill the slot itself.
        if slot.create_lock.try_lock().is_ok() {
            slots.remove(station);
        }
        info!(
            "Released session {} (epoch {})",
            station,
            session.epoch()
        );
    }
}

/// Shared handle; clone freely.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        settings: SessionSettings,
        resolver: Arc<dyn UpstreamResolver>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                settings,
                resolver,
                launcher,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Live session for `station_id`, starting one if needed.  Resolution
    /// and start errors are returned as-is and leave nothing registered.
    pub async fn acquire(&self, station_id: &str) -> Result<StationSession> {
        loop {
            let slot = self
                .inner
                .slots()
                .entry(station_id.to_string())
                .or_default()
                .clone();

            let _creating = slot.create_lock.lock().await;

            // The slot may have been released while we waited for the lock.
            let still_mapped = self
                .inner
                .slots()
                .get(station_id)
                .is_some_and(|s| Arc::ptr_eq(s, &slot));
            if !still_mapped {
                continue;
            }

            match slot.current() {
                Some(session) if session.is_alive() => {
                    debug!("Reusing session {} (epoch {})", station_id, session.epoch());
                    return Ok(session);
                }
                Some(dying) => {
                    // One transcoder per station: the old one must be gone first.
                    debug!(
                        "Waiting for stopped session {} (epoch {}) to finish",
                        station_id,
                        dying.epoch()
                    );
                    dying.finished().await;
                }
                None => {}
            }

            let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
            let hook: ReleaseHook = Box::new(move |session| {
                if let Some(registry) = weak.upgrade() {
                    registry.release(session);
                }
            });
            let started = StationSession::start(
                station_id,
                self.inner.settings.clone(),
                self.inner.resolver.clone(),
                self.inner.launcher.clone(),
                Some(hook),
            )
            .await;

            return match started {
                Ok(session) => {
                    slot.set(Some(session.clone()));
                    info!(
                        "Created session {} (epoch {})",
                        station_id,
                        session.epoch()
                    );
                    Ok(session)
                }
                Err(e) => {
                    let mut slots = self.inner.slots();
                    let ours = slots
                        .get(station_id)
                        .is_some_and(|s| Arc::ptr_eq(s, &slot));
                    if ours && slot.current().is_none() {
                        slots.remove(station_id);
                    }
                    Err(e)
                }
            };
        }
    }

    /// Acquire and attach a new consumer.  Returns the session and the
    /// consumer handle to pass to `StationSession::serve_consumer`.
    pub async fn attach(
        &self,
        station_id: &str,
        consumer_id: ConsumerId,
        sink: Box<dyn ConsumerSink>,
    ) -> Result<(StationSession, Arc<Consumer>)> {
        let consumer = Arc::new(Consumer::new(consumer_id, sink, Liveness::new()));
        for _ in 0..ATTACH_RETRIES {
            let session = self.acquire(station_id).await?;
            match session.attach(consumer.clone()) {
                Ok(()) => return Ok((session, consumer)),
                Err(StreamError::SessionStopped(_)) => {
                    debug!("Session {} stopped during attach, retrying", station_id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(StreamError::SessionStopped(station_id.to_string()))
    }

    /// The registered live session, without creating one.
    pub fn get(&self, station_id: &str) -> Option<StationSession> {
        self.inner
            .slots()
            .get(station_id)
            .and_then(|slot| slot.current())
            .filter(|s| s.is_alive())
    }

    pub fn status(&self) -> StatusReport {
        self.sessions()
            .into_iter()
            .map(|s| (s.station_id().to_string(), s.status()))
            .collect()
    }

    /// Stop one station.  Returns false if nothing was running.
    pub fn stop(&self, station_id: &str) -> bool {
        match self.get(station_id) {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    /// Stop everything and wait for every transcoder to be reaped.
    pub async fn stop_all(&self) {
        let sessions = self.sessions();
        info!("Stopping {} sessions", sessions.len());
        for session in &sessions {
            session.stop();
        }
        for session in &sessions {
            session.finished().await;
        }
    }

    fn sessions(&self) -> Vec<StationSession> {
        self.inner
            .slots()
            .values()
            .filter_map(|slot| slot.current())
            .filter(|s| s.is_alive())
            .collect()
    }
}
