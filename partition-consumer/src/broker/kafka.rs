//! Kafka implementation of [`BrokerClient`] on top of rdkafka.
//!
//! Subscriptions use manual partition assignment: every subscription owns a
//! `StreamConsumer` assigned to exactly one partition at an explicit offset.
//! No consumer group is joined and no offsets are committed; offset
//! bookkeeping beyond the last delivered offset belongs to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::{resolve_start_offset, BrokerClient, PollEvent, Subscribed};
use crate::error::{ConnectionError, ReadError, SubscriptionError};
use crate::types::{BrokerAddress, RawMessage, StartOffset, TopicPartition};

/// Kafka client configuration builder with defaults for assign-only readers.
///
/// `bootstrap.servers` is filled in per connection from the session's broker
/// address. `group.id` is still required by rdkafka, but no group is joined.
pub struct KafkaClientConfigBuilder {
    config: ClientConfig,
}

impl Default for KafkaClientConfigBuilder {
    fn default() -> Self {
        Self::new("partition-consumer")
    }
}

impl KafkaClientConfigBuilder {
    pub fn new(group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.config.set("client.id", client_id);
        self
    }

    /// Set minimum bytes to fetch from broker (triggers fetch when buffer has less than this)
    pub fn with_fetch_min_bytes(mut self, bytes: u32) -> Self {
        self.config.set("fetch.min.bytes", bytes.to_string());
        self
    }

    /// Set maximum wait time when fetch.min.bytes is not satisfied
    pub fn with_fetch_wait_max_ms(mut self, ms: u32) -> Self {
        self.config.set("fetch.wait.max.ms", ms.to_string());
        self
    }

    pub fn with_max_partition_fetch_bytes(mut self, bytes: u32) -> Self {
        self.config
            .set("max.partition.fetch.bytes", bytes.to_string());
        self
    }

    /// Set minimum number of messages to queue for prefetching
    pub fn with_queued_min_messages(mut self, messages: u32) -> Self {
        self.config.set("queued.min.messages", messages.to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

pub struct KafkaBroker {
    config: ClientConfig,
    // Applies to each metadata and watermark request
    operation_timeout: Duration,
}

pub struct KafkaConnection {
    address: BrokerAddress,
    config: ClientConfig,
    // Taken on disconnect, which drops the client and its broker sockets
    metadata: Mutex<Option<Arc<BaseConsumer>>>,
}

impl KafkaConnection {
    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        self.metadata.lock().is_some()
    }
}

pub struct KafkaSubscription {
    partition: TopicPartition,
    consumer: StreamConsumer,
}

impl KafkaBroker {
    pub fn new(config: ClientConfig, operation_timeout: Duration) -> Self {
        Self {
            config,
            operation_timeout,
        }
    }

    pub fn from_builder(builder: KafkaClientConfigBuilder, operation_timeout: Duration) -> Self {
        Self::new(builder.build(), operation_timeout)
    }
}

fn is_transport_error(e: &KafkaError) -> bool {
    matches!(
        e.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::Resolve
        )
    )
}

fn raw_message(message: &BorrowedMessage<'_>) -> RawMessage {
    RawMessage {
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        payload: message.payload().map(Bytes::copy_from_slice),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
    }
}

/// Look the partition up in fresh metadata and return its watermarks.
/// Blocking; run on the blocking pool.
fn fetch_partition_watermarks(
    consumer: &BaseConsumer,
    partition: &TopicPartition,
    timeout: Duration,
) -> Result<(i64, i64), SubscriptionError> {
    let broker_error = |e: KafkaError| SubscriptionError::Broker {
        partition: partition.clone(),
        reason: e.to_string(),
    };

    let metadata = consumer
        .fetch_metadata(Some(partition.topic()), timeout)
        .map_err(broker_error)?;

    let exists = metadata
        .topics()
        .iter()
        .filter(|topic| topic.name() == partition.topic() && topic.error().is_none())
        .any(|topic| {
            topic
                .partitions()
                .iter()
                .any(|p| p.id() == partition.partition_number())
        });
    if !exists {
        return Err(SubscriptionError::UnknownPartition(partition.clone()));
    }

    consumer
        .fetch_watermarks(partition.topic(), partition.partition_number(), timeout)
        .map_err(broker_error)
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    type Connection = KafkaConnection;
    type Subscription = KafkaSubscription;

    async fn connect(&self, address: &BrokerAddress) -> Result<KafkaConnection, ConnectionError> {
        if address.is_blank() {
            return Err(ConnectionError::InvalidAddress(address.clone()));
        }

        let mut config = self.config.clone();
        config.set("bootstrap.servers", address.as_str());

        let metadata: BaseConsumer = config.create().map_err(|e| ConnectionError::Handshake {
            address: address.clone(),
            reason: e.to_string(),
        })?;
        let metadata = Arc::new(metadata);

        // rdkafka connects lazily; a metadata round trip is the handshake
        let lookup_client = metadata.clone();
        let timeout = self.operation_timeout;
        let handshake = tokio::task::spawn_blocking(move || {
            lookup_client
                .fetch_metadata(None, timeout)
                .map(|cluster| (cluster.brokers().len(), cluster.topics().len()))
        })
        .await;

        match handshake {
            Ok(Ok((brokers, topics))) => {
                info!(%address, brokers, topics, "Connected to Kafka");
            }
            Ok(Err(e)) if is_transport_error(&e) => {
                return Err(ConnectionError::Unreachable {
                    address: address.clone(),
                    reason: e.to_string(),
                });
            }
            Ok(Err(e)) => {
                return Err(ConnectionError::Handshake {
                    address: address.clone(),
                    reason: e.to_string(),
                });
            }
            Err(join_err) => {
                return Err(ConnectionError::Handshake {
                    address: address.clone(),
                    reason: format!("metadata task failed: {join_err}"),
                });
            }
        }

        Ok(KafkaConnection {
            address: address.clone(),
            config,
            metadata: Mutex::new(Some(metadata)),
        })
    }

    async fn subscribe(
        &self,
        connection: &KafkaConnection,
        partition: &TopicPartition,
        start: StartOffset,
    ) -> Result<Subscribed<KafkaSubscription>, SubscriptionError> {
        let lookup_client = connection
            .metadata
            .lock()
            .clone()
            .ok_or(SubscriptionError::ConnectionClosed)?;
        let target = partition.clone();
        let timeout = self.operation_timeout;
        let (low, high) = tokio::task::spawn_blocking(move || {
            fetch_partition_watermarks(&lookup_client, &target, timeout)
        })
        .await
        .map_err(|join_err| SubscriptionError::Broker {
            partition: partition.clone(),
            reason: format!("watermark task failed: {join_err}"),
        })??;

        let start_offset = resolve_start_offset(partition, start, low, high)?;

        let broker_error = |e: KafkaError| SubscriptionError::Broker {
            partition: partition.clone(),
            reason: e.to_string(),
        };

        let consumer: StreamConsumer = connection.config.create().map_err(broker_error)?;
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(start_offset),
            )
            .map_err(broker_error)?;
        consumer.assign(&assignment).map_err(broker_error)?;

        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            low_watermark = low,
            high_watermark = high,
            start_offset,
            "Assigned Kafka partition"
        );

        Ok(Subscribed {
            subscription: KafkaSubscription {
                partition: partition.clone(),
                consumer,
            },
            start_offset,
        })
    }

    async fn poll(&self, subscription: &KafkaSubscription) -> Result<PollEvent, ReadError> {
        loop {
            match subscription.consumer.recv().await {
                Ok(message) => return Ok(PollEvent::Message(raw_message(&message))),
                // Only reported when enable.partition.eof is switched on by the caller
                Err(KafkaError::PartitionEOF(_)) => continue,
                Err(e) if is_transport_error(&e) => {
                    return Err(ReadError::ConnectionLost {
                        partition: subscription.partition.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    return Err(ReadError::Broker {
                        partition: subscription.partition.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn unsubscribe(&self, subscription: &KafkaSubscription) {
        if let Err(e) = subscription.consumer.unassign() {
            warn!(
                topic = subscription.partition.topic(),
                partition = subscription.partition.partition_number(),
                error = ?e,
                "Failed to unassign Kafka partition"
            );
        }
    }

    async fn disconnect(&self, connection: &KafkaConnection) {
        let client = connection.metadata.lock().take();
        if let Some(client) = client {
            // A watermark lookup still in flight may hold the last reference
            let shared = Arc::strong_count(&client) > 1;
            drop(client);
            info!(
                address = %connection.address,
                pending_lookups = shared,
                "Disconnected from Kafka"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_disable_commits() {
        let config = KafkaClientConfigBuilder::default().build();

        assert_eq!(config.get("group.id"), Some("partition-consumer"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.partition.eof"), Some("false"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_builder_tls_and_overrides() {
        let config = KafkaClientConfigBuilder::new("readers")
            .with_tls(true)
            .with_client_id("reader-1")
            .with_fetch_wait_max_ms(50)
            .set("debug", "consumer")
            .build();

        assert_eq!(config.get("group.id"), Some("readers"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("client.id"), Some("reader-1"));
        assert_eq!(config.get("fetch.wait.max.ms"), Some("50"));
        assert_eq!(config.get("debug"), Some("consumer"));
    }

    #[test]
    fn test_transport_errors_are_classified() {
        assert!(is_transport_error(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure
        )));
        assert!(is_transport_error(&KafkaError::MetadataFetch(
            RDKafkaErrorCode::AllBrokersDown
        )));
        assert!(!is_transport_error(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition
        )));
    }

    #[tokio::test]
    async fn test_blank_address_is_rejected_before_connecting() {
        let broker = KafkaBroker::from_builder(
            KafkaClientConfigBuilder::default(),
            Duration::from_millis(100),
        );

        let err = broker
            .connect(&BrokerAddress::from(" "))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectionError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_disconnect_releases_client() {
        let broker = KafkaBroker::from_builder(
            KafkaClientConfigBuilder::default(),
            Duration::from_millis(100),
        );
        let mut config = KafkaClientConfigBuilder::default().build();
        config.set("bootstrap.servers", "127.0.0.1:1");
        // Creating the client does not contact the broker
        let client: BaseConsumer = config.create().unwrap();
        let connection = KafkaConnection {
            address: BrokerAddress::from("127.0.0.1:1"),
            config,
            metadata: Mutex::new(Some(Arc::new(client))),
        };
        assert!(connection.is_open());

        broker.disconnect(&connection).await;
        assert!(!connection.is_open());
        broker.disconnect(&connection).await;

        let err = broker
            .subscribe(&connection, &TopicPartition::new("orders", 0), StartOffset::Earliest)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SubscriptionError::ConnectionClosed));
    }
}
