use super::*;

use std::time::Duration as StdDuration;

use chrono::Duration;
use shared::domain::{ConnectionId, ConnectionStatus};
use tokio::time::timeout;

use crate::test_support::{profile, record, sample_records, FakeSource, ALICE};

async fn next_event(events: &mut broadcast::Receiver<FeedEvent>) -> Option<FeedEvent> {
    timeout(StdDuration::from_secs(2), events.recv())
        .await
        .ok()
        .and_then(|received| received.ok())
}

async fn wait_for_update(events: &mut broadcast::Receiver<FeedEvent>) -> u64 {
    loop {
        match next_event(events).await {
            Some(FeedEvent::Updated { generation }) => return generation,
            Some(_) => continue,
            None => panic!("feed never reported an update"),
        }
    }
}

#[tokio::test]
async fn initial_load_reshapes_rows_and_derives_stats() {
    let (source, _changes) = FakeSource::new(sample_records());
    let feed = ConnectionFeed::start(source, ALICE).await.expect("start");

    let snapshot = feed.snapshot().await;
    assert_eq!(snapshot.phase, FeedPhase::Ready);
    assert_eq!(snapshot.generation, 1);
    assert_eq!(snapshot.error, None);

    let ids: Vec<i64> = snapshot.connections.iter().map(|c| c.id.0).collect();
    assert_eq!(ids, vec![3, 2, 1]);
    assert_eq!(snapshot.stats.active, 1);
    assert_eq!(snapshot.stats.pending, 2);
    assert_eq!(snapshot.stats.declined, 0);
    assert_eq!(snapshot.stats.total, snapshot.connections.len() as u64);
    assert!(snapshot.connections.iter().all(|c| c.self_id == ALICE));
}

#[tokio::test]
async fn newest_initiated_reload_wins_when_completions_interleave() {
    let (source, _changes) = FakeSource::new(Vec::new());
    let feed = ConnectionFeed::start(source.clone(), ALICE)
        .await
        .expect("start");

    let older_gate = source.gate_next_list();
    let newer_gate = source.gate_next_list();
    let now = Utc::now();
    let older_rows = vec![record(10, profile(2, "Stale Sam", None), "pending", now)];
    let newer_rows = vec![
        record(11, profile(3, "Fresh Fay", None), "accepted", now),
        record(12, profile(4, "Fresh Finn", None), "pending", now - Duration::days(1)),
    ];

    let release = async move {
        // The newer reload resolves first, the older one after it.
        let _ = newer_gate.send(Ok(newer_rows));
        tokio::task::yield_now().await;
        let _ = older_gate.send(Ok(older_rows));
    };
    let (older, newer, ()) = tokio::join!(feed.reload(), feed.reload(), release);

    assert_eq!(older, ReloadOutcome::Discarded);
    assert_eq!(newer, ReloadOutcome::Applied);
    let snapshot = feed.snapshot().await;
    assert_eq!(snapshot.generation, 3);
    let ids: Vec<i64> = snapshot.connections.iter().map(|c| c.id.0).collect();
    assert_eq!(ids, vec![11, 12]);
    assert_eq!(snapshot.stats.total, 2);
}

#[tokio::test]
async fn older_reload_finishing_last_cannot_overwrite_newer_result() {
    let (source, _changes) = FakeSource::new(Vec::new());
    let feed = ConnectionFeed::start(source.clone(), ALICE)
        .await
        .expect("start");

    let older_gate = source.gate_next_list();
    let newer_gate = source.gate_next_list();
    let now = Utc::now();

    let release = async move {
        let _ = older_gate.send(Ok(vec![record(20, profile(2, "Old", None), "pending", now)]));
        tokio::task::yield_now().await;
        let _ = newer_gate.send(Ok(vec![record(21, profile(3, "New", None), "pending", now)]));
    };
    let (older, newer, ()) = tokio::join!(feed.reload(), feed.reload(), release);

    assert_eq!(older, ReloadOutcome::Discarded);
    assert_eq!(newer, ReloadOutcome::Applied);
    let snapshot = feed.snapshot().await;
    assert_eq!(snapshot.connections.len(), 1);
    assert_eq!(snapshot.connections[0].id, ConnectionId(21));
}

#[tokio::test]
async fn change_notice_triggers_full_reload() {
    let (source, changes) = FakeSource::new(sample_records());
    let feed = ConnectionFeed::start(source.clone(), ALICE)
        .await
        .expect("start");
    let mut events = feed.events();

    let mut rows = source.rows();
    rows[1].status = "accepted".to_string();
    source.set_rows(rows);
    changes
        .send(ChangeNotice::Changed(ConnectionId(2)))
        .expect("notice");

    let generation = wait_for_update(&mut events).await;
    assert_eq!(generation, 2);
    let snapshot = feed.snapshot().await;
    assert_eq!(snapshot.stats.active, 2);
    assert_eq!(snapshot.stats.pending, 1);
    let changed = snapshot
        .connections
        .iter()
        .find(|c| c.id == ConnectionId(2))
        .expect("row");
    assert_eq!(changed.status, ConnectionStatus::Active);
    assert_eq!(changed.waiting_days, None);
}

#[tokio::test]
async fn failed_initial_load_enters_error_and_retry_recovers() {
    let (source, _changes) = FakeSource::new(sample_records());
    source.fail_next_list("store unavailable");

    let feed = ConnectionFeed::start(source, ALICE).await.expect("start");
    let snapshot = feed.snapshot().await;
    assert_eq!(snapshot.phase, FeedPhase::Error);
    assert_eq!(snapshot.error.as_deref(), Some("store unavailable"));
    assert!(snapshot.connections.is_empty());

    assert_eq!(feed.retry().await, ReloadOutcome::Applied);
    let snapshot = feed.snapshot().await;
    assert_eq!(snapshot.phase, FeedPhase::Ready);
    assert_eq!(snapshot.error, None);
    assert_eq!(snapshot.connections.len(), 3);
}

#[tokio::test]
async fn dropping_the_feed_discards_reloads_still_in_flight() {
    let (source, changes) = FakeSource::new(sample_records());
    let feed = ConnectionFeed::start(source.clone(), ALICE)
        .await
        .expect("start");
    let mut events = feed.events();

    let gate = source.gate_next_list();
    changes
        .send(ChangeNotice::Resync)
        .expect("notice");
    assert_eq!(
        next_event(&mut events).await,
        Some(FeedEvent::Loading { generation: 2 })
    );

    drop(feed);
    let _ = gate.send(Ok(Vec::new()));

    // The channel closes once the last reload lets go of the feed state.
    while let Ok(Ok(event)) = timeout(StdDuration::from_secs(2), events.recv()).await {
        assert!(
            !matches!(event, FeedEvent::Updated { .. }),
            "stopped feed applied a reload: {event:?}"
        );
    }
}

#[tokio::test]
async fn stop_is_idempotent_and_reports_closed() {
    let (source, _changes) = FakeSource::new(Vec::new());
    let feed = ConnectionFeed::start(source, ALICE).await.expect("start");
    assert!(!feed.is_closed());
    feed.stop();
    feed.stop();
    assert!(feed.is_closed());
    assert_eq!(feed.reload().await, ReloadOutcome::Discarded);
}

#[tokio::test]
async fn subscription_failure_fails_start() {
    let (source, _changes) = FakeSource::new(Vec::new());
    let _first = ConnectionFeed::start(source.clone(), ALICE)
        .await
        .expect("start");
    let second = ConnectionFeed::start(source, ALICE).await;
    assert!(second.is_err());
}

#[tokio::test]
async fn ended_change_stream_is_reported() {
    let (source, changes) = FakeSource::new(Vec::new());
    let feed = ConnectionFeed::start(source, ALICE).await.expect("start");
    let mut events = feed.events();
    drop(changes);
    assert_eq!(next_event(&mut events).await, Some(FeedEvent::SubscriptionEnded));
}
