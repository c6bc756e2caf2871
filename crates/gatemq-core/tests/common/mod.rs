#![allow(dead_code)]

use std::time::Duration;

use gatemq_core::{Broker, BrokerEvent};
use gatemq_types::{BrokerConfig, DestinationConfig, Message};
use tokio::sync::broadcast::{self, error::RecvError};

/// Upper bound for anything that is expected to happen
pub const PATIENCE: Duration = Duration::from_secs(2);

/// Window in which something expected NOT to happen must stay pending
pub const QUIET: Duration = Duration::from_millis(300);

pub fn broker() -> Broker {
    Broker::new(BrokerConfig::default()).unwrap()
}

/// Broker where `queue://<name>` has the given memory quota
pub fn broker_with_quota(name: &str, quota: u64) -> Broker {
    let config = BrokerConfig::default().with_destination(
        format!("queue://{name}"),
        DestinationConfig::default().with_quota(quota),
    );
    Broker::new(config).unwrap()
}

/// Message with a body of exactly `size` bytes
pub fn sized(size: usize) -> Message {
    Message::new(bytes::Bytes::from(vec![b'x'; size]))
}

/// Wait for the first event matching `pred`
pub async fn wait_for<F>(events: &mut broadcast::Receiver<BrokerEvent>, pred: F) -> BrokerEvent
where
    F: Fn(&BrokerEvent) -> bool,
{
    tokio::time::timeout(PATIENCE, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not observed in time")
}
