//! Narrow interface to a broker-protocol client.
//!
//! The consumer core never speaks a wire protocol itself. Everything it needs
//! from a broker goes through [`BrokerClient`]: open a connection, pin a
//! subscription to one partition at a resolved offset, poll it, and release
//! both again.

use async_trait::async_trait;

use crate::error::{ConnectionError, ReadError, SubscriptionError};
use crate::types::{BrokerAddress, RawMessage, StartOffset, TopicPartition};

pub mod kafka;
pub mod memory;

pub use kafka::{KafkaBroker, KafkaClientConfigBuilder};
pub use memory::MemoryBroker;

/// Outcome of a successful poll
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Message(RawMessage),
    /// The subscription will never yield another message
    EndOfStream,
}

/// A subscription together with the offset the broker resolved it to
pub struct Subscribed<S> {
    pub subscription: S,
    pub start_offset: i64,
}

/// Resolve a start offset against the partition's current watermarks.
///
/// `low` is the first retained offset and `high` the offset the next produced
/// record will get. An explicit offset must fall inside `[low, high]`.
pub fn resolve_start_offset(
    partition: &TopicPartition,
    start: StartOffset,
    low: i64,
    high: i64,
) -> Result<i64, SubscriptionError> {
    match start {
        StartOffset::Earliest => Ok(low),
        StartOffset::Latest => Ok(high),
        StartOffset::At(offset) if (low..=high).contains(&offset) => Ok(offset),
        StartOffset::At(_) => Err(SubscriptionError::OffsetRejected {
            partition: partition.clone(),
            offset: start,
            reason: format!("offset outside of available range [{low}, {high}]"),
        }),
    }
}

#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;
    type Subscription: Send + Sync + 'static;

    async fn connect(&self, address: &BrokerAddress) -> Result<Self::Connection, ConnectionError>;

    /// Subscribe to one partition. Sentinel offsets are resolved here, and the
    /// returned subscription is positioned at `start_offset` regardless of
    /// what is produced between this call and the first poll.
    async fn subscribe(
        &self,
        connection: &Self::Connection,
        partition: &TopicPartition,
        start: StartOffset,
    ) -> Result<Subscribed<Self::Subscription>, SubscriptionError>;

    /// Wait for the next record. Must be cancel safe: dropping the future
    /// before it resolves loses no record.
    async fn poll(&self, subscription: &Self::Subscription) -> Result<PollEvent, ReadError>;

    async fn unsubscribe(&self, subscription: &Self::Subscription);

    async fn disconnect(&self, connection: &Self::Connection);
}
