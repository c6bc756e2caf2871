//! Connection, destination and message lifecycles

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{broker, wait_for, PATIENCE};
use gatemq_core::{Broker, BrokerEvent};
use gatemq_storage::{MemoryStore, MessageStore};
use gatemq_types::{
    BrokerConfig, ConsumerOptions, DeliveryMode, DestinationConfig, DestinationKey,
    DestinationRef, Error, Message, MessageId, Result, SendOptions,
};
use parking_lot::Mutex;

#[tokio::test]
async fn expired_message_is_never_delivered() {
    let broker = broker();
    let conn = broker.connect_default().unwrap();
    let queue = DestinationRef::queue("stale");

    let message = Message::new("old").with_expiry(Utc::now() - chrono::Duration::seconds(1));
    conn.send(&queue, message).await.unwrap();
    conn.send(&queue, Message::new("fresh")).await.unwrap();

    let mut consumer = conn.subscribe(&queue).unwrap();
    let delivery = consumer.receive_timeout(PATIENCE).await.unwrap();
    assert_eq!(delivery.body_as_str(), Some("fresh"));

    let stats = broker.stats(queue.key()).unwrap();
    assert_eq!(stats.discarded_total, 1);
    assert_eq!(stats.usage_bytes, 0);
}

#[tokio::test]
async fn sweep_drops_messages_that_expire_while_pending() {
    let config = BrokerConfig::default().with_destination(
        "queue://ttl",
        DestinationConfig {
            message_ttl_secs: 1,
            ..Default::default()
        },
    );
    let broker = Broker::new(config).unwrap();
    let conn = broker.connect_default().unwrap();
    let queue = DestinationRef::queue("ttl");

    conn.send(&queue, Message::new("short-lived")).await.unwrap();
    let kept = Message::new("kept").with_ttl(chrono::Duration::hours(1));
    conn.send(&queue, kept).await.unwrap();
    assert_eq!(broker.sweep_expired(), 0);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(broker.sweep_expired(), 1);

    let stats = broker.stats(queue.key()).unwrap();
    assert_eq!(stats.pending_count, 1);
    assert_eq!(stats.usage_bytes, 4);
}

#[tokio::test]
async fn temporary_queue_is_deleted_with_its_connection() {
    let broker = broker();
    let owner = broker.connect_default().unwrap();
    let other = broker.connect_default().unwrap();
    let mut events = broker.events();

    let temp = owner.create_temporary_queue().unwrap();
    other.send(&temp, Message::new("reply")).await.unwrap();
    let destination = broker.get_destination(temp.key()).unwrap();
    assert_eq!(destination.owner(), Some(owner.id()));
    assert_eq!(broker.total_usage(), 5);

    owner.close().unwrap();
    let expected = temp.key().clone();
    wait_for(&mut events, |e| {
        matches!(e, BrokerEvent::DestinationDeleted { destination } if *destination == expected)
    })
    .await;

    assert!(broker.get_destination(temp.key()).is_none());
    assert_eq!(broker.total_usage(), 0);
}

#[tokio::test]
async fn closing_connection_redelivers_its_unacked_messages() {
    let broker = broker();
    let producer = broker.connect_default().unwrap();
    let doomed = broker.connect_default().unwrap();
    let survivor = broker.connect_default().unwrap();
    let queue = DestinationRef::queue("work");

    let mut lost = doomed
        .subscribe_with(&queue, ConsumerOptions::client_ack())
        .unwrap();
    producer.send(&queue, Message::new("job")).await.unwrap();
    assert!(lost.receive_timeout(PATIENCE).await.is_some());

    let mut kept = survivor
        .subscribe_with(&queue, ConsumerOptions::client_ack())
        .unwrap();
    doomed.close().unwrap();
    assert!(lost.receive().await.is_none());

    let delivery = kept.receive_timeout(PATIENCE).await.unwrap();
    assert_eq!(delivery.body_as_str(), Some("job"));
    assert!(delivery.redelivered());
    kept.ack(&delivery).unwrap();
    assert_eq!(broker.stats(queue.key()).unwrap().consumer_count, 1);
}

#[tokio::test]
async fn buffered_deliveries_of_a_closed_connection_are_withdrawn() {
    let broker = broker();
    let producer = broker.connect_default().unwrap();
    let doomed = broker.connect_default().unwrap();
    let survivor = broker.connect_default().unwrap();
    let queue = DestinationRef::queue("withdrawn");

    // Delivered into the channel but never taken out of it
    let mut stale = doomed
        .subscribe_with(&queue, ConsumerOptions::client_ack())
        .unwrap();
    producer.send(&queue, Message::new("job")).await.unwrap();
    assert_eq!(broker.stats(queue.key()).unwrap().in_flight_count, 1);

    let mut kept = survivor
        .subscribe_with(&queue, ConsumerOptions::client_ack())
        .unwrap();
    doomed.close().unwrap();

    assert!(stale.is_detached());
    assert!(stale.try_receive().is_none());
    assert!(stale.receive().await.is_none());

    let delivery = kept.receive_timeout(PATIENCE).await.unwrap();
    assert_eq!(delivery.body_as_str(), Some("job"));
    kept.ack(&delivery).unwrap();
    assert!(kept.try_receive().is_none());
}

#[tokio::test]
async fn withdrawn_deliveries_never_reach_a_replaced_exclusive_consumer() {
    let broker = broker();
    let producer = broker.connect_default().unwrap();
    let doomed = broker.connect_default().unwrap();
    let queue: DestinationRef = "queue://solo?exclusive=true".parse().unwrap();

    let mut first = doomed
        .subscribe_with(&queue, ConsumerOptions::client_ack())
        .unwrap();
    let mut second = producer
        .subscribe_with(&queue, ConsumerOptions::client_ack())
        .unwrap();
    for i in 0..2 {
        producer.send(&queue, Message::new(format!("m{i}"))).await.unwrap();
    }

    doomed.close().unwrap();
    assert!(first.try_receive().is_none());

    for i in 0..2 {
        let delivery = second.receive_timeout(PATIENCE).await.unwrap();
        assert_eq!(delivery.body_as_str(), Some(format!("m{i}").as_str()));
        second.ack(&delivery).unwrap();
    }
    assert_eq!(
        broker.stats(queue.key()).unwrap().active_consumer,
        Some(second.id())
    );
}

#[tokio::test]
async fn closed_connection_rejects_new_work() {
    let broker = broker();
    let conn = broker.connect_default().unwrap();
    let queue = DestinationRef::queue("q");
    conn.close().unwrap();
    conn.close().unwrap();

    assert!(matches!(
        conn.send(&queue, Message::new("x")).await,
        Err(Error::ConnectionClosed(_))
    ));
    assert!(matches!(
        conn.subscribe(&queue),
        Err(Error::ConnectionClosed(_))
    ));
    assert!(matches!(
        broker.close_connection(conn.id()),
        Err(Error::ConnectionNotFound(_))
    ));
}

#[tokio::test]
async fn deleting_a_destination_releases_blocked_producers() {
    let broker = common::broker_with_quota("gone", 10);
    let conn = broker.connect_default().unwrap();
    let queue = DestinationRef::queue("gone");
    let mut events = broker.events();

    conn.send(&queue, common::sized(10)).await.unwrap();
    let blocked = {
        let (conn, queue) = (conn.clone(), queue.clone());
        tokio::spawn(async move { conn.send(&queue, common::sized(5)).await })
    };
    wait_for(&mut events, |e| matches!(e, BrokerEvent::ProducerBlocked { .. })).await;

    broker.delete_destination(queue.key()).unwrap();
    let result = tokio::time::timeout(PATIENCE, blocked)
        .await
        .expect("blocked send finishes")
        .unwrap();
    assert!(matches!(result, Err(Error::DestinationNotFound(_))));
}

/// Store that remembers the order of calls
#[derive(Default)]
struct RecordingStore {
    inner: MemoryStore,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl MessageStore for RecordingStore {
    async fn append(&self, destination: &DestinationKey, message: &Message) -> Result<()> {
        self.calls.lock().push(format!("append {destination}"));
        self.inner.append(destination, message).await
    }

    async fn remove(&self, destination: &DestinationKey, message_id: &MessageId) -> Result<()> {
        self.calls.lock().push(format!("remove {destination}"));
        self.inner.remove(destination, message_id).await
    }

    async fn load(&self, destination: &DestinationKey) -> Result<Vec<Message>> {
        self.inner.load(destination).await
    }

    async fn count(&self, destination: &DestinationKey) -> Result<u64> {
        self.inner.count(destination).await
    }

    async fn remove_destination(&self, destination: &DestinationKey) -> Result<u64> {
        self.calls.lock().push(format!("drop {destination}"));
        self.inner.remove_destination(destination).await
    }
}

#[tokio::test]
async fn store_sees_only_persistent_traffic() {
    let store = Arc::new(RecordingStore::default());
    let broker = Broker::with_store(BrokerConfig::default(), store.clone()).unwrap();
    broker.start();

    let conn = broker.connect_default().unwrap();
    let queue = DestinationRef::queue("audit");

    conn.send(&queue, Message::new("transient")).await.unwrap();
    conn.send(
        &queue,
        Message::new("durable").with_delivery_mode(DeliveryMode::Persistent),
    )
    .await
    .unwrap();
    conn.send_with(&queue, Message::new("override"), SendOptions::persistent())
        .await
        .unwrap();
    broker.flush().await;
    assert_eq!(store.count(queue.key()).await.unwrap(), 2);

    let mut consumer = conn.subscribe(&queue).unwrap();
    for _ in 0..3 {
        consumer.receive_timeout(PATIENCE).await.unwrap();
    }
    broker.delete_destination(queue.key()).unwrap();
    broker.shutdown().await;

    let calls = store.calls.lock().clone();
    assert_eq!(
        calls,
        vec![
            "append queue://audit",
            "append queue://audit",
            "remove queue://audit",
            "remove queue://audit",
            "drop queue://audit",
        ]
    );
}
