//! Shared helpers for session integration tests over the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use partition_consumer::{
    ConsumedMessage, ConsumerSession, Deliveries, MemoryBroker, SessionConfig, TopicPartition,
};
use tokio::time::{sleep, timeout, Instant};

pub const BROKER_ADDRESS: &str = "memory:9092";
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub fn orders(partition: i32) -> TopicPartition {
    TopicPartition::new("orders", partition)
}

/// Broker with the given partitions already created at offset 0
pub fn broker_with(partitions: &[TopicPartition]) -> Arc<MemoryBroker> {
    let broker = Arc::new(MemoryBroker::new());
    for partition in partitions {
        broker.create_partition(partition);
    }
    broker
}

pub fn produce_n(broker: &MemoryBroker, partition: &TopicPartition, count: usize) {
    for i in 0..count {
        broker
            .produce(partition, None, format!("{partition}-{i}").as_bytes())
            .unwrap();
    }
}

pub async fn open_session(
    broker: &Arc<MemoryBroker>,
    buffer_size: usize,
) -> ConsumerSession<MemoryBroker> {
    ConsumerSession::connect(
        broker.clone(),
        BROKER_ADDRESS,
        SessionConfig::default()
            .with_delivery_buffer_size(buffer_size)
            .with_shutdown_grace(Duration::from_millis(500)),
    )
    .await
    .unwrap()
}

pub async fn recv(deliveries: &mut Deliveries) -> ConsumedMessage {
    timeout(RECV_TIMEOUT, deliveries.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("delivery stream ended")
}

pub async fn recv_n(deliveries: &mut Deliveries, count: usize) -> Vec<ConsumedMessage> {
    let mut messages = Vec::with_capacity(count);
    for _ in 0..count {
        messages.push(recv(deliveries).await);
    }
    messages
}

/// Offsets of `partition` in delivery order
pub fn offsets_of(messages: &[ConsumedMessage], partition: &TopicPartition) -> Vec<i64> {
    messages
        .iter()
        .filter(|m| m.partition() == partition)
        .map(ConsumedMessage::offset)
        .collect()
}

/// Wait until the reader for `partition` has read up to `offset`
pub async fn wait_for_forwarded(
    session: &ConsumerSession<MemoryBroker>,
    partition: &TopicPartition,
    offset: i64,
) {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while session.forwarded_offset(partition).await != Some(offset) {
        assert!(
            Instant::now() < deadline,
            "reader for {partition} never reached offset {offset}"
        );
        sleep(Duration::from_millis(5)).await;
    }
}
