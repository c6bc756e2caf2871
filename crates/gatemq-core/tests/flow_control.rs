//! Producer flow control: quotas, windows, reject-on-full, aborts

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{broker_with_quota, sized, wait_for, PATIENCE, QUIET};
use gatemq_core::{BlockReason, BrokerEvent, BrokerListener, SendOutcome, TrySend};
use gatemq_types::{
    ConnectionConfig, ConnectionId, DestinationKey, DestinationRef, Error, Message, SendOptions,
};

fn is_blocked_on_quota(event: &BrokerEvent) -> bool {
    matches!(
        event,
        BrokerEvent::ProducerBlocked {
            reason: BlockReason::Quota,
            ..
        }
    )
}

#[tokio::test]
async fn windowed_connection_blocks_only_the_full_destination() {
    let broker = broker_with_quota("A", 100);
    let conn = broker
        .connect(ConnectionConfig::default().with_producer_window(10_000))
        .unwrap();
    let a = DestinationRef::queue("A");
    let b = DestinationRef::queue("B");
    let mut events = broker.events();

    assert_eq!(conn.send(&a, sized(100)).await.unwrap(), SendOutcome::Accepted);

    let blocked = {
        let (conn, a) = (conn.clone(), a.clone());
        tokio::spawn(async move { conn.send(&a, sized(100)).await })
    };
    wait_for(&mut events, is_blocked_on_quota).await;

    let outcome = tokio::time::timeout(PATIENCE, conn.send(&b, sized(10)))
        .await
        .expect("send to B completes while A is blocked")
        .unwrap();
    assert_eq!(outcome, SendOutcome::Accepted);
    assert!(!blocked.is_finished());
    assert_eq!(broker.blocked_producers(a.key()), 1);

    // Consuming from A makes room for the blocked producer
    let mut consumer = conn.subscribe(&a).unwrap();
    consumer.receive().await.unwrap();

    let outcome = tokio::time::timeout(PATIENCE, blocked)
        .await
        .expect("blocked producer resumes")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, SendOutcome::BlockedThenAccepted);
    assert_eq!(broker.blocked_producers(a.key()), 0);
}

#[tokio::test]
async fn unwindowed_connection_blocks_all_its_sends() {
    let broker = broker_with_quota("A", 100);
    let conn = broker.connect_default().unwrap();
    let other = broker.connect_default().unwrap();
    let a = DestinationRef::queue("A");
    let b = DestinationRef::queue("B");
    let mut events = broker.events();

    conn.send(&a, sized(100)).await.unwrap();
    let blocked = {
        let (conn, a) = (conn.clone(), a.clone());
        tokio::spawn(async move { conn.send(&a, sized(100)).await })
    };
    wait_for(&mut events, is_blocked_on_quota).await;

    // Same connection: stuck behind the send to A
    let stuck = tokio::time::timeout(QUIET, conn.send(&b, sized(10))).await;
    assert!(stuck.is_err(), "send to B must wait behind the blocked send");

    // Other connections are unaffected
    tokio::time::timeout(PATIENCE, other.send(&b, sized(10)))
        .await
        .expect("other connection is not blocked")
        .unwrap();

    let mut consumer = other.subscribe(&a).unwrap();
    consumer.receive().await.unwrap();
    tokio::time::timeout(PATIENCE, blocked)
        .await
        .expect("blocked producer resumes")
        .unwrap()
        .unwrap();

    tokio::time::timeout(PATIENCE, conn.send(&b, sized(10)))
        .await
        .expect("lane is free again")
        .unwrap();
}

#[tokio::test]
async fn blocked_producers_resume_in_arrival_order() {
    let broker = broker_with_quota("fifo", 100);
    let a = DestinationRef::queue("fifo");
    let key = a.key().clone();
    let filler = broker.connect_default().unwrap();
    filler.send(&a, sized(100)).await.unwrap();

    // Each waiter needs 60 bytes, so only one fits at a time
    let mut pending = Vec::new();
    for (i, body) in ["first", "second"].into_iter().enumerate() {
        let conn = broker.connect_default().unwrap();
        let a = a.clone();
        pending.push(tokio::spawn(async move {
            conn.send(&a, Message::new(format!("{body:<60}"))).await
        }));
        while broker.blocked_producers(&key) <= i {
            tokio::task::yield_now().await;
        }
    }

    let mut consumer = filler.subscribe(&a).unwrap();
    let mut bodies = Vec::new();
    for _ in 0..3 {
        let delivery = consumer.receive_timeout(PATIENCE).await.unwrap();
        bodies.push(delivery.body_as_str().unwrap_or_default().trim_end().to_string());
    }
    assert_eq!(bodies[1..], ["first", "second"]);
    for task in pending {
        assert_eq!(task.await.unwrap().unwrap(), SendOutcome::BlockedThenAccepted);
    }
}

#[derive(Default)]
struct CountingListener {
    exceptions: AtomicUsize,
}

impl BrokerListener for CountingListener {
    fn on_resource_exception(&self, _connection: ConnectionId, _destination: &DestinationKey) {
        self.exceptions.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn reject_on_full_fails_fast_and_notifies() {
    let broker = broker_with_quota("A", 100);
    let listener = Arc::new(CountingListener::default());
    broker.add_listener(listener.clone());

    let conn = broker
        .connect(ConnectionConfig::default().with_reject_on_full(true))
        .unwrap();
    let a = DestinationRef::queue("A");

    conn.send(&a, sized(80)).await.unwrap();
    let err = conn.send(&a, sized(30)).await.unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted { .. }));
    assert!(err.is_send_failure());
    assert_eq!(listener.exceptions.load(Ordering::SeqCst), 1);

    // The failed send left nothing behind
    let stats = broker.stats(a.key()).unwrap();
    assert_eq!(stats.usage_bytes, 80);
    assert_eq!(stats.pending_count, 1);
    assert_eq!(stats.blocked_producers, 0);
    assert_eq!(conn.outstanding_credit(), 0);

    // Still room for something small
    conn.send(&a, sized(20)).await.unwrap();
}

#[tokio::test]
async fn reject_on_full_per_send_override() {
    let broker = broker_with_quota("A", 10);
    let conn = broker.connect_default().unwrap();
    let a = DestinationRef::queue("A");

    conn.send(&a, sized(10)).await.unwrap();
    let result = conn
        .send_with(&a, sized(1), SendOptions::reject_on_full())
        .await;
    assert!(matches!(result, Err(Error::ResourceExhausted { .. })));

    let result = conn.try_send_with(&a, sized(1), SendOptions::reject_on_full());
    assert!(matches!(result, Err(Error::ResourceExhausted { .. })));
}

#[tokio::test]
async fn try_send_hands_message_back_when_blocked() {
    let broker = broker_with_quota("A", 10);
    let conn = broker.connect_default().unwrap();
    let a = DestinationRef::queue("A");

    assert!(matches!(
        conn.try_send(&a, sized(10)).unwrap(),
        TrySend::Accepted
    ));
    match conn.try_send(&a, Message::new("later")).unwrap() {
        TrySend::Blocked { message, reason } => {
            assert_eq!(reason, BlockReason::Quota);
            assert_eq!(message.body_as_str(), Some("later"));
        }
        TrySend::Accepted => panic!("destination is full"),
    }
    assert_eq!(broker.stats(a.key()).unwrap().usage_bytes, 10);
}

#[tokio::test]
async fn closing_connection_aborts_blocked_send() {
    let broker = broker_with_quota("A", 100);
    let conn = broker.connect_default().unwrap();
    let a = DestinationRef::queue("A");
    let mut events = broker.events();

    conn.send(&a, sized(100)).await.unwrap();
    let blocked = {
        let (conn, a) = (conn.clone(), a.clone());
        tokio::spawn(async move { conn.send(&a, sized(50)).await })
    };
    wait_for(&mut events, is_blocked_on_quota).await;

    conn.close().unwrap();
    let result = tokio::time::timeout(PATIENCE, blocked)
        .await
        .expect("blocked send is aborted")
        .unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed(id)) if id == conn.id()));

    assert_eq!(broker.blocked_producers(a.key()), 0);
    assert_eq!(broker.stats(a.key()).unwrap().usage_bytes, 100);
    assert!(matches!(
        conn.send(&a, sized(1)).await,
        Err(Error::ConnectionClosed(_))
    ));
}

#[tokio::test]
async fn purge_releases_quota_for_blocked_producer() {
    let broker = broker_with_quota("A", 100);
    let conn = broker
        .connect(ConnectionConfig::default().with_producer_window(1_000))
        .unwrap();
    let a = DestinationRef::queue("A");
    let mut events = broker.events();

    conn.send(&a, sized(60)).await.unwrap();
    conn.send(&a, sized(40)).await.unwrap();
    let blocked = {
        let (conn, a) = (conn.clone(), a.clone());
        tokio::spawn(async move { conn.send(&a, sized(70)).await })
    };
    wait_for(&mut events, is_blocked_on_quota).await;

    assert_eq!(broker.purge(a.key()).unwrap(), 2);
    let outcome = tokio::time::timeout(PATIENCE, blocked)
        .await
        .expect("purge unblocks the producer")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, SendOutcome::BlockedThenAccepted);
    assert_eq!(broker.stats(a.key()).unwrap().usage_bytes, 70);
}

#[tokio::test]
async fn exhausted_window_blocks_until_broker_accepts() {
    let broker = broker_with_quota("A", 1_000);
    let conn = broker
        .connect(ConnectionConfig::default().with_producer_window(100))
        .unwrap();
    let a = DestinationRef::queue("A");

    // Credit is returned as soon as the broker accepts each send
    for _ in 0..5 {
        conn.send(&a, sized(100)).await.unwrap();
    }
    assert_eq!(conn.outstanding_credit(), 0);
    assert_eq!(broker.stats(a.key()).unwrap().usage_bytes, 500);
}

#[tokio::test]
async fn oversized_message_passes_only_an_empty_destination() {
    let broker = broker_with_quota("A", 10);
    let conn = broker.connect_default().unwrap();
    let a = DestinationRef::queue("A");

    conn.send(&a, sized(50)).await.unwrap();
    assert_eq!(broker.stats(a.key()).unwrap().usage_bytes, 50);
    assert!(broker.tracker().is_over_quota(a.key()));

    assert!(matches!(
        conn.try_send(&a, sized(1)).unwrap(),
        TrySend::Blocked {
            reason: BlockReason::Quota,
            ..
        }
    ));
}

#[tokio::test]
async fn release_is_idempotent_and_failed_reserve_is_free() {
    let broker = broker_with_quota("A", 100);
    let conn = broker.connect_default().unwrap();
    let a = DestinationRef::queue("A");
    conn.send(&a, sized(30)).await.unwrap();

    let tracker = broker.tracker();
    assert!(!tracker.reserve(a.key(), 80));
    assert_eq!(tracker.usage(a.key()), 30);

    assert_eq!(tracker.release(a.key(), 1_000), 30);
    assert_eq!(tracker.release(a.key(), 1_000), 0);
    assert_eq!(tracker.usage(a.key()), 0);
    assert_eq!(broker.total_usage(), 0);
}

#[tokio::test]
async fn producer_events_bracket_the_wait() {
    let broker = broker_with_quota("A", 100);
    let conn = broker.connect_default().unwrap();
    let other = broker.connect_default().unwrap();
    let a = DestinationRef::queue("A");
    let mut events = broker.events();

    conn.send(&a, sized(100)).await.unwrap();
    let blocked = {
        let (conn, a) = (conn.clone(), a.clone());
        tokio::spawn(async move { conn.send(&a, sized(10)).await })
    };
    wait_for(&mut events, is_blocked_on_quota).await;

    let mut consumer = other.subscribe(&a).unwrap();
    consumer.receive().await.unwrap();

    let resumed = wait_for(&mut events, |e| {
        matches!(e, BrokerEvent::ProducerResumed { .. })
    })
    .await;
    assert_eq!(
        resumed,
        BrokerEvent::ProducerResumed {
            connection: conn.id(),
            destination: a.key().clone(),
        }
    );
    blocked.await.unwrap().unwrap();
}
