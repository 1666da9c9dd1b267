use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the request header carrying the upstream auth token.
pub const AUTH_TOKEN_HEADER: &str = "X-Radiko-AuthToken";

/// Lifecycle of one station session.
///
/// Transitions:
///   Starting -> Running -> Draining -> Stopped
///   Running -> Starting -> Running          (internal reconnect)
///   Draining -> Running                     (listener came back in time)
///   any -> Stopped                          (explicit stop / unrecoverable)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Starting,
    Running,
    Draining,
    Stopped,
}

impl SessionPhase {
    /// True while the session can still accept listeners.
    pub fn is_alive(&self) -> bool {
        !matches!(self, SessionPhase::Stopped)
    }
}

/// Progress of the local player's stall recovery, polled by the UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ReconnectStatus {
    #[default]
    None,
    Started,
    Authenticating,
    Resuming,
    Succeeded,
    Failed,
}

impl ReconnectStatus {
    /// Short label for the status line.
    pub fn label(&self) -> Option<&'static str> {
        match self {
            ReconnectStatus::None => None,
            ReconnectStatus::Started => Some("reconnecting"),
            ReconnectStatus::Authenticating => Some("re-authenticating"),
            ReconnectStatus::Resuming => Some("resuming"),
            ReconnectStatus::Succeeded => Some("reconnected"),
            ReconnectStatus::Failed => Some("reconnect failed"),
        }
    }
}

/// One entry of `GET /api/status`.  Field names match the established wire
/// shape: `{"QRR":{"clients":2,"running":true}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StationStatus {
    #[serde(rename = "clients")]
    pub consumer_count: usize,
    pub running: bool,
}

/// Station id -> status, ordered for stable output.
pub type StatusReport = BTreeMap<String, StationStatus>;

/// A station as listed for an area.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Station {
    pub id: String,
    pub name: String,
}
