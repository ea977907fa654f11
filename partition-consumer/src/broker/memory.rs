//! In-process broker keeping partition logs in memory.
//!
//! Useful wherever a real Kafka cluster is not available: the test suite
//! drives the consumer core through it, and it supports injecting the
//! failures the core has to survive (unreachable broker, failed handshake,
//! dropped connections, partitions that end).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{resolve_start_offset, BrokerClient, PollEvent, Subscribed};
use crate::error::{ConnectionError, ReadError, SubscriptionError};
use crate::types::{BrokerAddress, RawMessage, StartOffset, TopicPartition};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryBrokerError {
    #[error("partition {0} does not exist")]
    UnknownPartition(TopicPartition),

    #[error("partition {0} is sealed")]
    Sealed(TopicPartition),
}

struct PartitionLog {
    base_offset: i64,
    records: Vec<RawMessage>,
    sealed: bool,
}

impl PartitionLog {
    fn new(base_offset: i64) -> Self {
        Self {
            base_offset,
            records: Vec::new(),
            sealed: false,
        }
    }

    fn high_watermark(&self) -> i64 {
        self.base_offset + self.records.len() as i64
    }

    fn get(&self, offset: i64) -> Option<&RawMessage> {
        if offset < self.base_offset {
            return None;
        }
        usize::try_from(offset - self.base_offset)
            .ok()
            .and_then(|index| self.records.get(index))
    }
}

struct Shared {
    logs: Mutex<HashMap<TopicPartition, PartitionLog>>,
    // Woken on every append, seal, unsubscribe and injected failure
    changed: Notify,
    reachable: AtomicBool,
    reject_handshake: AtomicBool,
    failure_epoch: AtomicU64,
    failure_reason: Mutex<String>,
    next_connection_id: AtomicU64,
    open_connections: AtomicUsize,
    active_subscriptions: AtomicUsize,
}

/// Cheap to clone; clones share the same logs.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

pub struct MemoryConnection {
    id: u64,
    open: Arc<AtomicBool>,
}

pub struct MemorySubscription {
    partition: TopicPartition,
    connection_id: u64,
    connection_open: Arc<AtomicBool>,
    next_offset: AtomicI64,
    seen_failure_epoch: AtomicU64,
    active: AtomicBool,
}

impl MemorySubscription {
    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// The offset the next poll will return
    pub fn position(&self) -> i64 {
        self.next_offset.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                logs: Mutex::new(HashMap::new()),
                changed: Notify::new(),
                reachable: AtomicBool::new(true),
                reject_handshake: AtomicBool::new(false),
                failure_epoch: AtomicU64::new(0),
                failure_reason: Mutex::new(String::new()),
                next_connection_id: AtomicU64::new(1),
                open_connections: AtomicUsize::new(0),
                active_subscriptions: AtomicUsize::new(0),
            }),
        }
    }

    /// Create an empty partition whose first offset is 0.
    pub fn create_partition(&self, partition: &TopicPartition) {
        self.create_partition_at(partition, 0);
    }

    /// Create an empty partition whose first offset is `base_offset`, as if
    /// earlier records had already been removed by retention.
    pub fn create_partition_at(&self, partition: &TopicPartition, base_offset: i64) {
        self.shared
            .logs
            .lock()
            .entry(partition.clone())
            .or_insert_with(|| PartitionLog::new(base_offset));
    }

    /// Append a record and return its offset.
    pub fn produce(
        &self,
        partition: &TopicPartition,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<i64, MemoryBrokerError> {
        let offset = {
            let mut logs = self.shared.logs.lock();
            let log = logs
                .get_mut(partition)
                .ok_or_else(|| MemoryBrokerError::UnknownPartition(partition.clone()))?;
            if log.sealed {
                return Err(MemoryBrokerError::Sealed(partition.clone()));
            }

            let offset = log.high_watermark();
            log.records.push(RawMessage {
                offset,
                key: key.map(Bytes::copy_from_slice),
                payload: Some(Bytes::copy_from_slice(value)),
                timestamp: Some(Utc::now()),
            });
            offset
        };

        self.shared.changed.notify_waiters();
        Ok(offset)
    }

    /// Mark the partition as complete: readers get end-of-stream once they
    /// have drained it.
    pub fn seal_partition(&self, partition: &TopicPartition) -> Result<(), MemoryBrokerError> {
        {
            let mut logs = self.shared.logs.lock();
            let log = logs
                .get_mut(partition)
                .ok_or_else(|| MemoryBrokerError::UnknownPartition(partition.clone()))?;
            log.sealed = true;
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    pub fn high_watermark(&self, partition: &TopicPartition) -> Option<i64> {
        self.shared
            .logs
            .lock()
            .get(partition)
            .map(PartitionLog::high_watermark)
    }

    /// New connection attempts fail while the broker is unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_reject_handshake(&self, reject: bool) {
        self.shared.reject_handshake.store(reject, Ordering::SeqCst);
    }

    /// Simulate a connection drop. Every live subscription fails its next
    /// poll exactly once for this event.
    pub fn drop_connections(&self, reason: &str) {
        *self.shared.failure_reason.lock() = reason.to_string();
        let epoch = self.shared.failure_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(epoch, reason, "Injected broker connection failure");
        self.shared.changed.notify_waiters();
    }

    pub fn open_connections(&self) -> usize {
        self.shared.open_connections.load(Ordering::SeqCst)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.shared.active_subscriptions.load(Ordering::SeqCst)
    }

    fn poll_once(&self, subscription: &MemorySubscription) -> Option<Result<PollEvent, ReadError>> {
        if !subscription.active.load(Ordering::SeqCst) {
            return Some(Ok(PollEvent::EndOfStream));
        }

        let epoch = self.shared.failure_epoch.load(Ordering::SeqCst);
        if subscription
            .seen_failure_epoch
            .swap(epoch, Ordering::SeqCst)
            < epoch
        {
            return Some(Err(ReadError::ConnectionLost {
                partition: subscription.partition.clone(),
                reason: self.shared.failure_reason.lock().clone(),
            }));
        }

        if !subscription.connection_open.load(Ordering::SeqCst) {
            return Some(Err(ReadError::ConnectionLost {
                partition: subscription.partition.clone(),
                reason: format!("connection {} closed", subscription.connection_id),
            }));
        }

        let logs = self.shared.logs.lock();
        let Some(log) = logs.get(&subscription.partition) else {
            return Some(Err(ReadError::Broker {
                partition: subscription.partition.clone(),
                reason: "partition no longer exists".to_string(),
            }));
        };

        let next = subscription.next_offset.load(Ordering::SeqCst);
        if let Some(raw) = log.get(next) {
            subscription.next_offset.store(next + 1, Ordering::SeqCst);
            return Some(Ok(PollEvent::Message(raw.clone())));
        }

        if log.sealed {
            return Some(Ok(PollEvent::EndOfStream));
        }

        None
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    type Connection = MemoryConnection;
    type Subscription = MemorySubscription;

    async fn connect(&self, address: &BrokerAddress) -> Result<MemoryConnection, ConnectionError> {
        if address.is_blank() {
            return Err(ConnectionError::InvalidAddress(address.clone()));
        }
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::Unreachable {
                address: address.clone(),
                reason: "connection refused".to_string(),
            });
        }
        if self.shared.reject_handshake.load(Ordering::SeqCst) {
            return Err(ConnectionError::Handshake {
                address: address.clone(),
                reason: "unsupported protocol version".to_string(),
            });
        }

        let id = self.shared.next_connection_id.fetch_add(1, Ordering::SeqCst);
        self.shared.open_connections.fetch_add(1, Ordering::SeqCst);
        debug!(connection_id = id, %address, "Opened in-memory broker connection");

        Ok(MemoryConnection {
            id,
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn subscribe(
        &self,
        connection: &MemoryConnection,
        partition: &TopicPartition,
        start: StartOffset,
    ) -> Result<Subscribed<MemorySubscription>, SubscriptionError> {
        if !connection.open.load(Ordering::SeqCst) {
            return Err(SubscriptionError::ConnectionClosed);
        }

        let start_offset = {
            let logs = self.shared.logs.lock();
            let log = logs
                .get(partition)
                .ok_or_else(|| SubscriptionError::UnknownPartition(partition.clone()))?;
            resolve_start_offset(partition, start, log.base_offset, log.high_watermark())?
        };

        self.shared
            .active_subscriptions
            .fetch_add(1, Ordering::SeqCst);

        let subscription = MemorySubscription {
            partition: partition.clone(),
            connection_id: connection.id,
            connection_open: connection.open.clone(),
            next_offset: AtomicI64::new(start_offset),
            seen_failure_epoch: AtomicU64::new(self.shared.failure_epoch.load(Ordering::SeqCst)),
            active: AtomicBool::new(true),
        };

        Ok(Subscribed {
            subscription,
            start_offset,
        })
    }

    async fn poll(&self, subscription: &MemorySubscription) -> Result<PollEvent, ReadError> {
        loop {
            // Register interest before inspecting state so a notification
            // between the check and the await is not missed
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.poll_once(subscription) {
                return event;
            }

            notified.await;
        }
    }

    async fn unsubscribe(&self, subscription: &MemorySubscription) {
        if subscription.active.swap(false, Ordering::SeqCst) {
            self.shared
                .active_subscriptions
                .fetch_sub(1, Ordering::SeqCst);
            self.shared.changed.notify_waiters();
        }
    }

    async fn disconnect(&self, connection: &MemoryConnection) {
        if connection.open.swap(false, Ordering::SeqCst) {
            self.shared.open_connections.fetch_sub(1, Ordering::SeqCst);
            self.shared.changed.notify_waiters();
            debug!(connection_id = connection.id, "Closed in-memory broker connection");
        }
    }
}
