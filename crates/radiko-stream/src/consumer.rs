//! Downstream consumers: an id, a sink, and a one-shot liveness signal.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StreamError};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unique per attach, so reconnects from the same address never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// `<transport>-<unix nanos>-<seq>`
    pub fn generate(transport: &str) -> Self {
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("{}-{}-{}", transport, nanos, seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConsumerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Set exactly once, by the consumer's own disconnect or by a failed write.
#[derive(Debug, Clone, Default)]
pub struct Liveness(CancellationToken);

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.cancel();
    }

    pub fn is_signalled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn signalled(&self) {
        self.0.cancelled().await
    }
}

/// Anything the session can push chunks into.
#[async_trait]
pub trait ConsumerSink: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<()>;
}

/// Forwards chunks into an mpsc channel; the HTTP body drains the receiver.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ConsumerSink for ChannelSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| StreamError::ConsumerWrite("receiver closed".into()))
    }
}

/// An attached consumer as seen by a session.
pub struct Consumer {
    id: ConsumerId,
    sink: Mutex<Box<dyn ConsumerSink>>,
    liveness: Liveness,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("liveness", &self.liveness)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    pub fn new(id: ConsumerId, sink: Box<dyn ConsumerSink>, liveness: Liveness) -> Self {
        Self {
            id,
            sink: Mutex::new(sink),
            liveness,
        }
    }

    pub fn id(&self) -> &ConsumerId {
        &self.id
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Write one chunk within `timeout`.  Any failure signals liveness.
    pub async fn deliver(&self, chunk: Bytes, timeout: Duration) -> Result<()> {
        if self.liveness.is_signalled() {
            return Err(StreamError::ConsumerWrite("consumer gone".into()));
        }
        let mut sink = self.sink.lock().await;
        let result = match tokio::time::timeout(timeout, sink.write(chunk)).await {
            Ok(res) => res,
            Err(_) => Err(StreamError::ConsumerWrite(format!(
                "write timed out after {:?}",
                timeout
            ))),
        };
        if result.is_err() {
            self.liveness.signal();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_per_attach() {
        let a = ConsumerId::generate("10.0.0.1");
        let b = ConsumerId::generate("10.0.0.1");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("10.0.0.1-"));
    }

    #[tokio::test]
    async fn channel_sink_failure_signals_liveness() {
        let (tx, rx) = mpsc::channel(1);
        let liveness = Liveness::new();
        let consumer = Consumer::new("a".into(), Box::new(ChannelSink::new(tx)), liveness.clone());

        consumer
            .deliver(Bytes::from_static(b"x"), Duration::from_secs(1))
            .await
            .unwrap();
        drop(rx);
        assert!(consumer
            .deliver(Bytes::from_static(b"y"), Duration::from_secs(1))
            .await
            .is_err());
        assert!(liveness.is_signalled());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sink_times_out() {
        let (tx, _rx) = mpsc::channel(1);
        let consumer = Consumer::new("slow".into(), Box::new(ChannelSink::new(tx)), Liveness::new());
        consumer
            .deliver(Bytes::from_static(b"1"), Duration::from_millis(50))
            .await
            .unwrap();
        // Channel full and never drained.
        let err = consumer
            .deliver(Bytes::from_static(b"2"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::ConsumerWrite(_)));
        assert!(consumer.liveness().is_signalled());
    }
}
