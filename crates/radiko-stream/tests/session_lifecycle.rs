mod common;

use std::sync::Arc;
use std::time::Duration;

use radiko_proto::protocol::SessionPhase;
use radiko_stream::{ConsumerId, SessionRegistry, StreamError};

use common::*;

fn registry_with(
    settings: radiko_stream::SessionSettings,
) -> (SessionRegistry, Arc<FakeResolver>, Arc<FakeLauncher>) {
    let resolver = FakeResolver::with_delay(Duration::from_millis(50));
    let launcher = FakeLauncher::new();
    let registry = SessionRegistry::new(settings, resolver.clone(), launcher.clone());
    (registry, resolver, launcher)
}

#[tokio::test(start_paused = true)]
async fn concurrent_first_attaches_share_one_start() {
    let (registry, resolver, launcher) = registry_with(quiet_settings());

    let mut joins = Vec::new();
    for i in 0..8 {
        let registry = registry.clone();
        joins.push(tokio::spawn(async move {
            let id = ConsumerId::from(format!("10.0.0.{}", i).as_str());
            let (session, _consumer) = registry.attach("QRR", id, Box::new(NullSink)).await?;
            Ok::<_, StreamError>(session.epoch())
        }));
    }
    let mut epochs = Vec::new();
    for join in joins {
        epochs.push(join.await.unwrap().unwrap());
    }

    assert!(epochs.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(resolver.calls(), 1);
    assert_eq!(launcher.count(), 1);
    assert_eq!(registry.status()["QRR"].consumer_count, 8);
    assert!(registry.status()["QRR"].running);
}

#[tokio::test(start_paused = true)]
async fn reattach_within_grace_reuses_process() {
    let (registry, resolver, launcher) = registry_with(quiet_settings());

    let (session, a) = registry
        .attach("QRR", "a".into(), Box::new(NullSink))
        .await
        .unwrap();
    let pid = session.process_id();
    assert!(pid.is_some());
    assert!(!session.has_idle_timer());

    session.detach(a.id());
    assert!(session.has_idle_timer());
    assert_eq!(session.phase(), SessionPhase::Draining);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let (again, _b) = registry
        .attach("QRR", "b".into(), Box::new(NullSink))
        .await
        .unwrap();
    assert!(again.same_session(&session));
    assert_eq!(again.process_id(), pid);
    assert!(!again.has_idle_timer());
    assert_eq!(again.phase(), SessionPhase::Running);

    // Well past the first deadline: the cancelled timer must not fire.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(session.is_alive());
    assert_eq!(session.process_id(), pid);
    assert_eq!(resolver.calls(), 1);
    assert_eq!(launcher.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_expiry_kills_process_and_unregisters() {
    let (registry, resolver, launcher) = registry_with(quiet_settings());

    let (session, a) = registry
        .attach("QRR", "a".into(), Box::new(NullSink))
        .await
        .unwrap();
    session.detach(a.id());

    tokio::time::sleep(Duration::from_secs(11)).await;
    session.finished().await;
    assert_eq!(session.phase(), SessionPhase::Stopped);
    assert!(launcher.last().killed.is_cancelled());
    assert!(registry.status().is_empty());
    assert!(registry.get("QRR").is_none());

    let (fresh, _b) = registry
        .attach("QRR", "b".into(), Box::new(NullSink))
        .await
        .unwrap();
    assert!(!fresh.same_session(&session));
    assert_ne!(fresh.epoch(), session.epoch());
    assert_eq!(resolver.calls(), 2);
    assert_eq!(launcher.count(), 2);
    assert!(!launcher.saw_overlap());
}

#[tokio::test(start_paused = true)]
async fn two_listeners_then_idle_teardown() {
    let (registry, _resolver, launcher) = registry_with(quiet_settings());

    let (session, a) = registry
        .attach("X", "a".into(), Box::new(NullSink))
        .await
        .unwrap();
    let pid = session.process_id();

    let (same, b) = registry
        .attach("X", "b".into(), Box::new(NullSink))
        .await
        .unwrap();
    assert!(same.same_session(&session));
    assert_eq!(same.process_id(), pid);
    assert_eq!(registry.status()["X"].consumer_count, 2);

    session.detach(a.id());
    assert_eq!(session.consumer_count(), 1);
    assert!(!session.has_idle_timer());

    session.detach(b.id());
    assert_eq!(session.consumer_count(), 0);
    assert!(session.has_idle_timer());

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(registry.status().contains_key("X"));

    tokio::time::sleep(Duration::from_secs(2)).await;
    session.finished().await;
    assert!(launcher.last().killed.is_cancelled());
    assert!(!registry.status().contains_key("X"));
}

#[tokio::test(start_paused = true)]
async fn resolution_failure_registers_nothing() {
    let (registry, resolver, launcher) = registry_with(quiet_settings());
    resolver.set_failing(true);

    let err = registry
        .attach("QRR", "a".into(), Box::new(NullSink))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Resolution(_)));
    assert!(registry.status().is_empty());
    assert_eq!(launcher.count(), 0);

    resolver.set_failing(false);
    let (session, _a) = registry
        .attach("QRR", "a".into(), Box::new(NullSink))
        .await
        .unwrap();
    assert!(session.is_alive());
}

#[tokio::test(start_paused = true)]
async fn process_start_failure_registers_nothing() {
    let (registry, _resolver, launcher) = registry_with(quiet_settings());
    launcher.set_failing(true);

    let err = registry
        .attach("QRR", "a".into(), Box::new(NullSink))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::ProcessStart(_)));
    assert!(registry.status().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_signal_detaches_consumer() {
    let (registry, _resolver, _launcher) = registry_with(quiet_settings());
    let (session, consumer) = registry
        .attach("QRR", "a".into(), Box::new(NullSink))
        .await
        .unwrap();

    let (gone_tx, gone_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .serve_consumer(consumer, async {
                    let _ = gone_rx.await;
                })
                .await
        })
    };
    settle().await;
    assert_eq!(session.consumer_count(), 1);

    gone_tx.send(()).unwrap();
    serving.await.unwrap();
    assert_eq!(session.consumer_count(), 0);
    assert!(session.has_idle_timer());
}

#[tokio::test(start_paused = true)]
async fn explicit_stop_releases_consumers() {
    let (registry, _resolver, launcher) = registry_with(quiet_settings());
    let (session, consumer) = registry
        .attach("QRR", "a".into(), Box::new(NullSink))
        .await
        .unwrap();

    assert!(registry.stop("QRR"));
    assert!(consumer.liveness().is_signalled());
    session.finished().await;
    assert!(launcher.last().killed.is_cancelled());
    assert!(!registry.stop("QRR"));

    // A stale handle refuses new consumers.
    let late = Arc::new(radiko_stream::Consumer::new(
        "late".into(),
        Box::new(NullSink),
        radiko_stream::Liveness::new(),
    ));
    assert!(matches!(
        session.attach(late),
        Err(StreamError::SessionStopped(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_all_reaps_every_process() {
    let (registry, _resolver, launcher) = registry_with(quiet_settings());
    for station in ["QRR", "TBS", "LFR"] {
        registry
            .attach(station, "a".into(), Box::new(NullSink))
            .await
            .unwrap();
    }
    assert_eq!(registry.status().len(), 3);

    registry.stop_all().await;
    assert!(registry.status().is_empty());
    assert!(launcher.all().iter().all(|l| l.killed.is_cancelled()));
}

#[tokio::test(start_paused = true)]
async fn stop_then_immediate_attach_waits_for_old_process() {
    let launcher = FakeLauncher::new();
    let registry = SessionRegistry::new(quiet_settings(), FakeResolver::new(), launcher.clone());
    let (old, _a) = registry
        .attach("QRR", "a".into(), Box::new(NullSink))
        .await
        .unwrap();
    let first = launcher.last();

    assert!(registry.stop("QRR"));
    let (fresh, _b) = registry
        .attach("QRR", "b".into(), Box::new(NullSink))
        .await
        .unwrap();

    assert!(!launcher.saw_overlap());
    assert!(first.killed.is_cancelled());
    assert_eq!(launcher.count(), 2);
    assert_eq!(launcher.alive("QRR"), 1);
    assert_ne!(fresh.epoch(), old.epoch());
    assert_eq!(fresh.process_id(), Some(launcher.last().id));

    // The old session's release must not unregister its replacement.
    settle().await;
    assert!(registry.get("QRR").is_some_and(|s| s.same_session(&fresh)));
}

#[tokio::test(start_paused = true)]
async fn fresh_session_drains_until_first_attach() {
    let (registry, _resolver, launcher) = registry_with(quiet_settings());

    let session = registry.acquire("QRR").await.unwrap();
    assert_eq!(session.phase(), SessionPhase::Draining);
    assert!(session.has_idle_timer());

    let consumer = Arc::new(radiko_stream::Consumer::new(
        "a".into(),
        Box::new(NullSink),
        radiko_stream::Liveness::new(),
    ));
    session.attach(consumer).unwrap();
    assert_eq!(session.phase(), SessionPhase::Running);
    assert!(!session.has_idle_timer());
    assert_eq!(launcher.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unused_fresh_session_expires_after_grace() {
    let (registry, _resolver, launcher) = registry_with(quiet_settings());

    let session = registry.acquire("QRR").await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    session.finished().await;

    assert_eq!(session.phase(), SessionPhase::Stopped);
    assert!(launcher.last().killed.is_cancelled());
    assert!(registry.get("QRR").is_none());
}

#[tokio::test(start_paused = true)]
async fn superseded_idle_timer_does_not_stop_session() {
    let (registry, _resolver, _launcher) = registry_with(quiet_settings());
    let (session, a) = registry
        .attach("QRR", "a".into(), Box::new(NullSink))
        .await
        .unwrap();

    // First timer would fire at ~10s; the second one is armed at ~5s.
    session.detach(a.id());
    tokio::time::sleep(Duration::from_secs(5)).await;
    let (_, b) = registry
        .attach("QRR", "b".into(), Box::new(NullSink))
        .await
        .unwrap();
    session.detach(b.id());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(session.is_alive());
    assert!(session.has_idle_timer());

    tokio::time::sleep(Duration::from_secs(5)).await;
    session.finished().await;
    assert_eq!(session.phase(), SessionPhase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn attach_at_grace_deadline_never_lands_on_a_stopped_session() {
    let (registry, _resolver, _launcher) = registry_with(quiet_settings());
    let (session, a) = registry
        .attach("QRR", "a".into(), Box::new(NullSink))
        .await
        .unwrap();
    session.detach(a.id());

    // Wake exactly when the idle timer does; either side may win.
    tokio::time::sleep(registry.settings().grace_period).await;
    let (joined, b) = registry
        .attach("QRR", "b".into(), Box::new(NullSink))
        .await
        .unwrap();

    settle().await;
    assert!(joined.is_alive());
    assert!(!b.liveness().is_signalled());
    assert_eq!(joined.consumer_count(), 1);
    assert_eq!(joined.phase(), SessionPhase::Running);
}
