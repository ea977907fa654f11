//! Partition Reader - Ordered, lazily pulled view of a single partition
//!
//! A reader owns one broker subscription. Each call to [`PartitionReader::next`]
//! yields the next record with an offset strictly greater than the previous
//! one, the closed-sequence signal (`Ok(None)`), or a [`ReadError`]. A read
//! error is reported once; afterwards the reader is `Failed` and only yields
//! `Ok(None)` until the caller opens a new reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, PollEvent, Subscribed};
use crate::error::{ReadError, SubscriptionError};
use crate::metrics_consts::{READER_OFFSETS_SKIPPED, READER_READ_ERRORS};
use crate::types::{ConsumedMessage, StartOffset, TopicPartition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStatus {
    /// Producing messages
    Active,
    /// Surfaced a read error, needs to be reopened
    Failed,
    /// Reached end of stream or was closed
    Finished,
}

struct ReaderState {
    status: ReaderStatus,
    last_offset: Option<i64>,
}

pub struct PartitionReader<B: BrokerClient> {
    partition: TopicPartition,
    client: Arc<B>,
    subscription: B::Subscription,
    start_offset: i64,
    state: Mutex<ReaderState>,
    // Serializes concurrent next() calls so offsets stay ordered
    cursor: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl<B: BrokerClient> PartitionReader<B> {
    /// Subscribe to `partition` and position the reader at `start`.
    ///
    /// `cancel` is the reader's shutdown signal; cancelling it has the same
    /// effect on a pending `next()` as calling [`close`](Self::close).
    pub async fn open(
        client: Arc<B>,
        connection: &B::Connection,
        partition: TopicPartition,
        start: StartOffset,
        cancel: CancellationToken,
    ) -> Result<Self, SubscriptionError> {
        let Subscribed {
            subscription,
            start_offset,
        } = client.subscribe(connection, &partition, start).await?;

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            requested = %start,
            start_offset,
            "Opened partition reader"
        );

        Ok(Self {
            partition,
            client,
            subscription,
            start_offset,
            state: Mutex::new(ReaderState {
                status: ReaderStatus::Active,
                last_offset: None,
            }),
            cursor: tokio::sync::Mutex::new(()),
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// The offset the subscription was resolved to when it was opened
    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    /// Offset of the last message returned by `next()`
    pub fn last_offset(&self) -> Option<i64> {
        self.state.lock().last_offset
    }

    pub fn status(&self) -> ReaderStatus {
        self.state.lock().status
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for the next message.
    pub async fn next(&self) -> Result<Option<ConsumedMessage>, ReadError> {
        let _cursor = self.cursor.lock().await;

        loop {
            if self.cancel.is_cancelled() || self.status() != ReaderStatus::Active {
                return Ok(None);
            }

            let event = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        "Reader cancelled while waiting for a message"
                    );
                    return Ok(None);
                }

                event = self.client.poll(&self.subscription) => event,
            };

            match event {
                Ok(PollEvent::Message(raw)) => {
                    let mut state = self.state.lock();
                    let stale = raw.offset < self.start_offset
                        || state.last_offset.is_some_and(|last| raw.offset <= last);
                    if stale {
                        debug!(
                            topic = self.partition.topic(),
                            partition = self.partition.partition_number(),
                            offset = raw.offset,
                            last_offset = ?state.last_offset,
                            start_offset = self.start_offset,
                            "Skipping record that does not advance the offset"
                        );
                        metrics::counter!(
                            READER_OFFSETS_SKIPPED,
                            "topic" => self.partition.topic().to_string(),
                            "partition" => self.partition.partition_number().to_string()
                        )
                        .increment(1);
                        continue;
                    }

                    state.last_offset = Some(raw.offset);
                    return Ok(Some(ConsumedMessage::from_raw(self.partition.clone(), raw)));
                }
                Ok(PollEvent::EndOfStream) => {
                    self.finish(ReaderStatus::Finished);
                    info!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        last_offset = ?self.last_offset(),
                        "Partition reached end of stream"
                    );
                    return Ok(None);
                }
                Err(e) => {
                    self.finish(ReaderStatus::Failed);
                    warn!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        last_offset = ?self.last_offset(),
                        error = ?e,
                        "Partition reader failed"
                    );
                    metrics::counter!(
                        READER_READ_ERRORS,
                        "topic" => self.partition.topic().to_string(),
                        "partition" => self.partition.partition_number().to_string(),
                        "error" => e.error_type()
                    )
                    .increment(1);
                    return Err(e);
                }
            }
        }
    }

    /// Release the subscription. Idempotent, and safe while another task is
    /// waiting in `next()`: that call returns `Ok(None)`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        self.finish(ReaderStatus::Finished);
        self.client.unsubscribe(&self.subscription).await;

        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            last_offset = ?self.last_offset(),
            "Closed partition reader"
        );
    }

    // Failed and Finished are terminal; only an active reader changes status
    fn finish(&self, status: ReaderStatus) {
        let mut state = self.state.lock();
        if state.status == ReaderStatus::Active {
            state.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::types::BrokerAddress;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        broker: Arc<MemoryBroker>,
        connection: <MemoryBroker as BrokerClient>::Connection,
        partition: TopicPartition,
    }

    async fn fixture(base_offset: i64, values: &[&str]) -> Fixture {
        let broker = Arc::new(MemoryBroker::new());
        let partition = TopicPartition::new("orders", 0);
        broker.create_partition_at(&partition, base_offset);
        for value in values {
            broker.produce(&partition, None, value.as_bytes()).unwrap();
        }
        let connection = broker.connect(&BrokerAddress::from("memory")).await.unwrap();
        Fixture {
            broker,
            connection,
            partition,
        }
    }

    async fn open(fixture: &Fixture, start: StartOffset) -> PartitionReader<MemoryBroker> {
        PartitionReader::open(
            fixture.broker.clone(),
            &fixture.connection,
            fixture.partition.clone(),
            start,
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    async fn next_offset(reader: &PartitionReader<MemoryBroker>) -> i64 {
        timeout(Duration::from_secs(1), reader.next())
            .await
            .expect("reader should produce a message")
            .unwrap()
            .expect("reader should not be closed")
            .offset()
    }

    #[tokio::test]
    async fn test_reads_existing_messages_in_order() {
        let fixture = fixture(10, &["a", "b", "c"]).await;
        let reader = open(&fixture, StartOffset::Earliest).await;

        assert_eq!(reader.start_offset(), 10);
        assert_eq!(next_offset(&reader).await, 10);
        assert_eq!(next_offset(&reader).await, 11);
        assert_eq!(next_offset(&reader).await, 12);
        assert_eq!(reader.last_offset(), Some(12));

        // Nothing more yet: next() keeps waiting for offset 13
        assert!(timeout(Duration::from_millis(30), reader.next()).await.is_err());

        fixture.broker.produce(&fixture.partition, None, b"d").unwrap();
        assert_eq!(next_offset(&reader).await, 13);
    }

    #[tokio::test]
    async fn test_explicit_offset_skips_older_messages() {
        let fixture = fixture(0, &["a", "b", "c", "d"]).await;
        let reader = open(&fixture, StartOffset::At(2)).await;

        assert_eq!(next_offset(&reader).await, 2);
        assert_eq!(next_offset(&reader).await, 3);
    }

    #[tokio::test]
    async fn test_latest_keeps_messages_produced_before_first_next() {
        let fixture = fixture(0, &["old-1", "old-2"]).await;
        let reader = open(&fixture, StartOffset::Latest).await;
        assert_eq!(reader.start_offset(), 2);

        fixture
            .broker
            .produce(&fixture.partition, None, b"new")
            .unwrap();

        let message = reader.next().await.unwrap().unwrap();
        assert_eq!(message.offset(), 2);
        assert_eq!(message.value(), b"new");
    }

    #[tokio::test]
    async fn test_unknown_partition_fails_to_open() {
        let fixture = fixture(0, &[]).await;

        let result = PartitionReader::open(
            fixture.broker.clone(),
            &fixture.connection,
            TopicPartition::new("missing", 0),
            StartOffset::Earliest,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(SubscriptionError::UnknownPartition(_))
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_next() {
        let fixture = fixture(0, &[]).await;
        let reader = Arc::new(open(&fixture, StartOffset::Earliest).await);

        let waiting = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        reader.close().await;
        reader.close().await;

        let result = timeout(Duration::from_millis(500), waiting)
            .await
            .expect("pending next() should return promptly after close")
            .unwrap();
        assert_eq!(result, Ok(None));
        assert!(reader.is_closed());
        assert_eq!(reader.status(), ReaderStatus::Finished);
        assert_eq!(fixture.broker.active_subscriptions(), 0);

        // Closed readers stay closed
        assert_eq!(reader.next().await, Ok(None));
    }

    #[tokio::test]
    async fn test_read_error_is_surfaced_once() {
        let fixture = fixture(0, &["a"]).await;
        let reader = open(&fixture, StartOffset::Earliest).await;

        assert_eq!(next_offset(&reader).await, 0);

        fixture.broker.drop_connections("broker restarted");

        let err = reader.next().await.unwrap_err();
        assert!(matches!(err, ReadError::ConnectionLost { .. }));
        assert_eq!(err.partition(), &fixture.partition);
        assert_eq!(reader.status(), ReaderStatus::Failed);

        fixture.broker.produce(&fixture.partition, None, b"b").unwrap();
        assert_eq!(reader.next().await, Ok(None));
        assert_eq!(reader.next().await, Ok(None));
        assert_eq!(reader.last_offset(), Some(0));
    }

    #[tokio::test]
    async fn test_end_of_stream_finishes_reader() {
        let fixture = fixture(0, &["a"]).await;
        fixture.broker.seal_partition(&fixture.partition).unwrap();
        let reader = open(&fixture, StartOffset::Earliest).await;

        assert_eq!(next_offset(&reader).await, 0);
        assert_eq!(reader.next().await, Ok(None));
        assert_eq!(reader.status(), ReaderStatus::Finished);
    }

    /// Broker replaying a fixed script of poll results, then waiting forever
    struct ScriptedBroker {
        events: Mutex<std::collections::VecDeque<Result<PollEvent, ReadError>>>,
    }

    #[async_trait::async_trait]
    impl BrokerClient for ScriptedBroker {
        type Connection = ();
        type Subscription = ();

        async fn connect(
            &self,
            _address: &BrokerAddress,
        ) -> Result<(), crate::error::ConnectionError> {
            Ok(())
        }

        async fn subscribe(
            &self,
            _connection: &(),
            _partition: &TopicPartition,
            _start: StartOffset,
        ) -> Result<Subscribed<()>, SubscriptionError> {
            Ok(Subscribed {
                subscription: (),
                start_offset: 5,
            })
        }

        async fn poll(&self, _subscription: &()) -> Result<PollEvent, ReadError> {
            let next = self.events.lock().pop_front();
            match next {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }

        async fn unsubscribe(&self, _subscription: &()) {}

        async fn disconnect(&self, _connection: &()) {}
    }

    fn raw(offset: i64) -> Result<PollEvent, ReadError> {
        Ok(PollEvent::Message(crate::types::RawMessage {
            offset,
            key: None,
            payload: Some(bytes::Bytes::from(offset.to_string())),
            timestamp: None,
        }))
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_offsets_are_skipped() {
        let broker = Arc::new(ScriptedBroker {
            events: Mutex::new([raw(3), raw(5), raw(6), raw(6), raw(4), raw(8)].into()),
        });
        let reader = PartitionReader::open(
            broker,
            &(),
            TopicPartition::new("orders", 0),
            StartOffset::At(5),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut offsets = Vec::new();
        for _ in 0..3 {
            let message = timeout(Duration::from_secs(1), reader.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            offsets.push(message.offset());
        }

        assert_eq!(offsets, vec![5, 6, 8]);
    }

    #[tokio::test]
    async fn test_cancellation_token_stops_reader() {
        let fixture = fixture(0, &[]).await;
        let cancel = CancellationToken::new();
        let reader = PartitionReader::open(
            fixture.broker.clone(),
            &fixture.connection,
            fixture.partition.clone(),
            StartOffset::Earliest,
            cancel.child_token(),
        )
        .await
        .unwrap();

        cancel.cancel();

        let result = timeout(Duration::from_millis(500), reader.next())
            .await
            .unwrap();
        assert_eq!(result, Ok(None));
    }
}
