//! Consumer Session - Connection lifecycle and per-partition forwarding
//!
//! A session owns one broker connection and any number of partition readers.
//! Each reader gets a dedicated forwarding task and a bounded delivery lane:
//! 1. Ordering is preserved within each partition
//! 2. Partitions are forwarded in parallel and independently
//! 3. Backpressure from a slow caller suspends forwarding, never drops messages

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::delivery::{self, Deliveries, LaneRegistry};
use crate::error::{ConnectionError, ReadError, SubscriptionError};
use crate::metrics_consts::{
    SESSION_ABANDONED_TASKS, SESSION_ACTIVE_READERS, SESSION_LANE_SEND_WAIT_MS,
    SESSION_SUBSCRIBE_ERRORS,
};
use crate::offset_tracker::DeliveredOffsets;
use crate::reader::{PartitionReader, ReaderStatus};
use crate::types::{BrokerAddress, ConsumedMessage, StartOffset, TopicPartition};

/// Configuration for a consumer session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Messages buffered per partition before its forwarding task waits
    pub delivery_buffer_size: usize,
    /// How long close() waits for forwarding tasks before aborting them
    pub shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            delivery_buffer_size: 100,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn with_delivery_buffer_size(mut self, size: usize) -> Self {
        self.delivery_buffer_size = size.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// A reader that stopped because of a read error
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderFailure {
    pub partition: TopicPartition,
    /// Last offset the failed reader queued for delivery. Everything up to
    /// it still reaches the delivery stream, so a new subscription resumes at
    /// `last_delivered + 1`.
    pub last_delivered: Option<i64>,
    pub error: ReadError,
}

struct ReaderHandle<B: BrokerClient> {
    reader: Arc<PartitionReader<B>>,
    task: JoinHandle<()>,
}

pub struct ConsumerSession<B: BrokerClient> {
    address: BrokerAddress,
    config: SessionConfig,
    client: Arc<B>,
    connection: B::Connection,
    // Held across reader open so subscribe and close never interleave
    readers: tokio::sync::Mutex<HashMap<TopicPartition, ReaderHandle<B>>>,
    state: Mutex<SessionState>,
    shutdown: CancellationToken,
    lanes: Mutex<Option<LaneRegistry>>,
    deliveries: Mutex<Option<Deliveries>>,
    offsets: Arc<DeliveredOffsets>,
    failures_tx: mpsc::UnboundedSender<ReaderFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<ReaderFailure>>>,
}

impl<B: BrokerClient> ConsumerSession<B> {
    /// Connect to the broker and return an open session with no readers.
    pub async fn connect(
        client: Arc<B>,
        address: impl Into<BrokerAddress>,
        config: SessionConfig,
    ) -> Result<Self, ConnectionError> {
        let address = address.into();
        if address.is_blank() {
            return Err(ConnectionError::InvalidAddress(address));
        }

        let connection = match client.connect(&address).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(%address, error = ?e, "Failed to open consumer session");
                return Err(e);
            }
        };

        let shutdown = CancellationToken::new();
        let offsets = Arc::new(DeliveredOffsets::new());
        let (lanes, deliveries) =
            delivery::channel(config.delivery_buffer_size, shutdown.clone(), offsets.clone());
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        info!(
            %address,
            delivery_buffer_size = config.delivery_buffer_size,
            shutdown_grace_ms = config.shutdown_grace.as_millis() as u64,
            "Consumer session open"
        );

        Ok(Self {
            address,
            config,
            client,
            connection,
            readers: tokio::sync::Mutex::new(HashMap::new()),
            state: Mutex::new(SessionState::Open),
            shutdown,
            lanes: Mutex::new(Some(lanes)),
            deliveries: Mutex::new(Some(deliveries)),
            offsets,
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
        })
    }

    pub fn broker_address(&self) -> &BrokerAddress {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Take the delivery stream. Only the first call returns it.
    pub fn deliveries(&self) -> Option<Deliveries> {
        self.deliveries.lock().take()
    }

    /// Take the stream of per-partition read failures. Only the first call
    /// returns it.
    pub fn failures(&self) -> Option<mpsc::UnboundedReceiver<ReaderFailure>> {
        self.failures_rx.lock().take()
    }

    /// Highest offset the delivery stream has handed to the caller for
    /// `partition`. Messages still buffered in the lane are not counted.
    pub fn last_delivered_offset(&self, partition: &TopicPartition) -> Option<i64> {
        self.offsets.get(partition)
    }

    /// Highest offset the current reader for `partition` has read from the
    /// broker, whether or not the caller has received it yet
    pub async fn forwarded_offset(&self, partition: &TopicPartition) -> Option<i64> {
        self.readers
            .lock()
            .await
            .get(partition)
            .and_then(|handle| handle.reader.last_offset())
    }

    pub async fn status(&self, partition: &TopicPartition) -> Option<ReaderStatus> {
        self.readers
            .lock()
            .await
            .get(partition)
            .map(|handle| handle.reader.status())
    }

    /// Every partition the session holds a reader for, sorted
    pub async fn subscriptions(&self) -> Vec<(TopicPartition, ReaderStatus)> {
        let readers = self.readers.lock().await;
        let mut subscriptions: Vec<_> = readers
            .iter()
            .map(|(partition, handle)| (partition.clone(), handle.reader.status()))
            .collect();
        subscriptions.sort_by(|a, b| a.0.cmp(&b.0));
        subscriptions
    }

    /// Open a reader for `partition` and start forwarding its messages.
    ///
    /// Returns once the subscription is confirmed by the broker. A partition
    /// whose previous reader failed or finished can be subscribed again.
    pub async fn subscribe(
        &self,
        partition: TopicPartition,
        start: StartOffset,
    ) -> Result<(), SubscriptionError> {
        let result = self.try_subscribe(partition.clone(), start).await;
        if let Err(e) = &result {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                start = %start,
                error = ?e,
                "Subscribe failed"
            );
            metrics::counter!(SESSION_SUBSCRIBE_ERRORS, "error" => e.error_type()).increment(1);
        }
        result
    }

    async fn try_subscribe(
        &self,
        partition: TopicPartition,
        start: StartOffset,
    ) -> Result<(), SubscriptionError> {
        if self.state() != SessionState::Open {
            return Err(SubscriptionError::SessionClosed);
        }

        let mut readers = self.readers.lock().await;

        if let Some(existing) = readers.get(&partition) {
            if existing.reader.status() == ReaderStatus::Active {
                return Err(SubscriptionError::AlreadySubscribed(partition));
            }
        }
        if let Some(stale) = readers.remove(&partition) {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                status = ?stale.reader.status(),
                "Replacing stopped reader"
            );
            self.release(&partition, stale).await;
        }

        let reader = PartitionReader::open(
            self.client.clone(),
            &self.connection,
            partition.clone(),
            start,
            self.shutdown.child_token(),
        )
        .await?;
        let reader = Arc::new(reader);

        // close() may have started while the broker confirmed the subscription
        if self.state() != SessionState::Open {
            reader.close().await;
            return Err(SubscriptionError::SessionClosed);
        }

        // Same lane as any previous reader, so its buffered tail stays first
        let lane = self
            .lanes
            .lock()
            .as_mut()
            .map(|lanes| lanes.lane(&partition));
        let Some(lane) = lane else {
            reader.close().await;
            return Err(SubscriptionError::SessionClosed);
        };

        // Starting at or below what the caller already has is a replay and
        // begins a new offset sequence
        let replay = self
            .offsets
            .get(&partition)
            .is_some_and(|last| reader.start_offset() <= last);
        if replay {
            self.offsets.clear_partition(&partition);
        }

        let task = tokio::spawn(forward(reader.clone(), lane, self.failures_tx.clone()));
        readers.insert(partition, ReaderHandle { reader, task });

        Ok(())
    }

    /// Stop and release the reader for `partition`. Returns false if the
    /// session had no reader for it. Other partitions are unaffected.
    pub async fn unsubscribe(&self, partition: &TopicPartition) -> bool {
        let handle = self.readers.lock().await.remove(partition);
        match handle {
            Some(handle) => {
                self.release(partition, handle).await;
                info!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Unsubscribed partition"
                );
                true
            }
            None => false,
        }
    }

    /// Close every reader, wait for forwarding to stop, then disconnect.
    ///
    /// Idempotent and infallible: cleanup problems are logged. After this
    /// returns the delivery stream yields no further messages.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Open {
                debug!(address = %self.address, state = ?*state, "Session already closing");
                return;
            }
            *state = SessionState::Closing;
        }

        info!(address = %self.address, "Closing consumer session");
        self.shutdown.cancel();

        let handles: Vec<_> = self.readers.lock().await.drain().collect();
        // Dropping the registry lets the delivery stream finish
        self.lanes.lock().take();

        let deadline = Instant::now() + self.config.shutdown_grace;
        let reader_count = handles.len();
        join_all(
            handles
                .into_iter()
                .map(|(partition, handle)| self.release_by(partition, handle, deadline)),
        )
        .await;

        self.client.disconnect(&self.connection).await;
        *self.state.lock() = SessionState::Closed;

        info!(
            address = %self.address,
            readers = reader_count,
            "Consumer session closed"
        );
    }

    async fn release(&self, partition: &TopicPartition, handle: ReaderHandle<B>) {
        let deadline = Instant::now() + self.config.shutdown_grace;
        self.release_by(partition.clone(), handle, deadline).await;
    }

    // Closing the reader and joining its forwarding task share one deadline.
    // Whatever is still running at the deadline is abandoned.
    async fn release_by(
        &self,
        partition: TopicPartition,
        handle: ReaderHandle<B>,
        deadline: Instant,
    ) {
        let ReaderHandle { reader, mut task } = handle;
        reader.cancellation().cancel();

        let stopped = tokio::time::timeout_at(deadline, async {
            reader.close().await;
            (&mut task).await
        })
        .await;

        match stopped {
            Ok(Ok(())) => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Forwarding task stopped"
                );
            }
            Ok(Err(e)) => {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    error = ?e,
                    "Forwarding task panicked"
                );
            }
            Err(_) => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    grace_ms = self.config.shutdown_grace.as_millis() as u64,
                    reader_closed = reader.is_closed(),
                    "Reader did not stop within grace period, abandoning it"
                );
                metrics::counter!(SESSION_ABANDONED_TASKS).increment(1);
                task.abort();
            }
        }
    }
}

impl<B: BrokerClient> Drop for ConsumerSession<B> {
    fn drop(&mut self) {
        if *self.state.get_mut() != SessionState::Closed {
            let partitions = held_partitions(self.readers.get_mut());
            warn!(
                address = %self.address,
                partitions = %partitions,
                "Consumer session dropped without close(), broker resources are not released"
            );
            self.shutdown.cancel();
        }
    }
}

// Sorted `topic:partition` list for log lines
fn held_partitions<R>(readers: &HashMap<TopicPartition, R>) -> String {
    let mut partitions: Vec<_> = readers.keys().collect();
    partitions.sort();
    partitions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Pull messages from one reader into its lane until the reader stops.
async fn forward<B: BrokerClient>(
    reader: Arc<PartitionReader<B>>,
    lane: mpsc::Sender<ConsumedMessage>,
    failures: mpsc::UnboundedSender<ReaderFailure>,
) {
    let partition = reader.partition().clone();
    let cancel = reader.cancellation().clone();

    info!(
        topic = partition.topic(),
        partition = partition.partition_number(),
        start_offset = reader.start_offset(),
        "Starting forwarding task"
    );
    metrics::gauge!(SESSION_ACTIVE_READERS).increment(1.0);

    loop {
        let message = match reader.next().await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(error) => {
                let last_delivered = reader.last_offset();
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    last_delivered = ?last_delivered,
                    error = ?error,
                    "Read error, partition stops forwarding until resubscribed"
                );
                let failure = ReaderFailure {
                    partition: partition.clone(),
                    last_delivered,
                    error,
                };
                if failures.send(failure).is_err() {
                    debug!("Failure stream dropped, failure only logged");
                }
                break;
            }
        };

        let offset = message.offset();
        let wait_started = Instant::now();

        let sent = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset,
                    "Shutdown while waiting for lane capacity"
                );
                break;
            }

            sent = lane.send(message) => sent,
        };

        metrics::histogram!(SESSION_LANE_SEND_WAIT_MS)
            .record(wait_started.elapsed().as_secs_f64() * 1000.0);

        if sent.is_err() {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset,
                "Delivery stream dropped, stopping forwarding"
            );
            break;
        }
    }

    metrics::gauge!(SESSION_ACTIVE_READERS).decrement(1.0);
    info!(
        topic = partition.topic(),
        partition = partition.partition_number(),
        last_forwarded = ?reader.last_offset(),
        "Forwarding task stopped"
    );
}
