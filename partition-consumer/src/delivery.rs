//! Delivery stream handed to the caller.
//!
//! Every subscribed partition gets its own bounded lane. A full lane only
//! suspends the forwarding task of that partition; [`Deliveries`] merges all
//! lanes into one stream, so other partitions keep flowing.
//!
//! A partition keeps its lane for the whole session. A replacement reader
//! writes behind whatever its predecessor left buffered, so offsets stay in
//! order across a resubscribe.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{SelectAll, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::metrics_consts::SESSION_MESSAGES_DELIVERED;
use crate::offset_tracker::DeliveredOffsets;
use crate::types::{ConsumedMessage, TopicPartition};

/// Session side: owns one lane per partition and hands new receivers over
pub(crate) struct LaneRegistry {
    registrations: mpsc::UnboundedSender<mpsc::Receiver<ConsumedMessage>>,
    lanes: HashMap<TopicPartition, mpsc::Sender<ConsumedMessage>>,
    buffer_size: usize,
}

impl LaneRegistry {
    /// The lane for `partition`, opened on first use. If the delivery stream
    /// is gone, the returned sender is closed and the first send fails.
    pub(crate) fn lane(&mut self, partition: &TopicPartition) -> mpsc::Sender<ConsumedMessage> {
        if let Some(sender) = self.lanes.get(partition) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (sender, receiver) = mpsc::channel(self.buffer_size);
        if self.registrations.send(receiver).is_err() {
            tracing::debug!(%partition, "Delivery stream dropped, lane opened closed");
        }
        self.lanes.insert(partition.clone(), sender.clone());
        sender
    }
}

/// Read-only stream of every message delivered by a session.
///
/// Yields `None` once the session has started closing, or once the session is
/// gone and every lane is drained. A message counts as delivered, and shows
/// up in the session's `last_delivered_offset`, only when this stream hands
/// it out.
pub struct Deliveries {
    lanes: SelectAll<ReceiverStream<ConsumedMessage>>,
    registrations: mpsc::UnboundedReceiver<mpsc::Receiver<ConsumedMessage>>,
    registrations_closed: bool,
    shutdown: CancellationToken,
    offsets: Arc<DeliveredOffsets>,
}

pub(crate) fn channel(
    buffer_size: usize,
    shutdown: CancellationToken,
    offsets: Arc<DeliveredOffsets>,
) -> (LaneRegistry, Deliveries) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registry = LaneRegistry {
        registrations: tx,
        lanes: HashMap::new(),
        buffer_size: buffer_size.max(1),
    };
    let deliveries = Deliveries {
        lanes: SelectAll::new(),
        registrations: rx,
        registrations_closed: false,
        shutdown,
        offsets,
    };
    (registry, deliveries)
}

impl Deliveries {
    /// Wait for the next message from any partition
    pub async fn recv(&mut self) -> Option<ConsumedMessage> {
        self.next().await
    }

    /// Number of partition lanes currently merged into this stream
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn record_delivery(&self, message: &ConsumedMessage) {
        self.offsets
            .mark_delivered(message.partition(), message.offset());
        metrics::counter!(
            SESSION_MESSAGES_DELIVERED,
            "topic" => message.topic().to_string(),
            "partition" => message.partition_number().to_string()
        )
        .increment(1);
    }
}

impl Stream for Deliveries {
    type Item = ConsumedMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if this.shutdown.is_cancelled() {
            return Poll::Ready(None);
        }

        while !this.registrations_closed {
            match this.registrations.poll_recv(cx) {
                Poll::Ready(Some(receiver)) => this.lanes.push(ReceiverStream::new(receiver)),
                Poll::Ready(None) => this.registrations_closed = true,
                Poll::Pending => break,
            }
        }

        match this.lanes.poll_next_unpin(cx) {
            Poll::Ready(Some(message)) => {
                this.record_delivery(&message);
                Poll::Ready(Some(message))
            }
            // No lanes left; more may still be registered while the session lives
            Poll::Ready(None) if this.registrations_closed => Poll::Ready(None),
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    fn orders(partition: i32) -> TopicPartition {
        TopicPartition::new("orders", partition)
    }

    fn message(partition: i32, offset: i64) -> ConsumedMessage {
        ConsumedMessage::new(orders(partition), offset, None, Bytes::from_static(b"v"), None)
    }

    fn test_channel(
        buffer_size: usize,
        shutdown: CancellationToken,
    ) -> (LaneRegistry, Deliveries, Arc<DeliveredOffsets>) {
        let offsets = Arc::new(DeliveredOffsets::new());
        let (registry, deliveries) = channel(buffer_size, shutdown, offsets.clone());
        (registry, deliveries, offsets)
    }

    #[tokio::test]
    async fn test_merges_lanes_and_keeps_lane_order() {
        let (mut registry, mut deliveries, _) = test_channel(8, CancellationToken::new());
        let lane0 = registry.lane(&orders(0));
        let lane1 = registry.lane(&orders(1));

        for offset in 0..3 {
            lane0.send(message(0, offset)).await.unwrap();
            lane1.send(message(1, offset + 100)).await.unwrap();
        }

        let mut seen: Vec<(i32, i64)> = Vec::new();
        for _ in 0..6 {
            let m = deliveries.recv().await.unwrap();
            seen.push((m.partition_number(), m.offset()));
        }

        let p0: Vec<i64> = seen.iter().filter(|(p, _)| *p == 0).map(|(_, o)| *o).collect();
        let p1: Vec<i64> = seen.iter().filter(|(p, _)| *p == 1).map(|(_, o)| *o).collect();
        assert_eq!(p0, vec![0, 1, 2]);
        assert_eq!(p1, vec![100, 101, 102]);
        assert_eq!(deliveries.lane_count(), 2);
    }

    #[tokio::test]
    async fn test_partition_keeps_one_lane() {
        let (mut registry, mut deliveries, _) = test_channel(8, CancellationToken::new());

        let first = registry.lane(&orders(0));
        for offset in 0..3 {
            first.send(message(0, offset)).await.unwrap();
        }
        drop(first);

        // A replacement writer queues behind what is still buffered
        let second = registry.lane(&orders(0));
        for offset in 3..6 {
            second.send(message(0, offset)).await.unwrap();
        }

        let mut offsets = Vec::new();
        for _ in 0..6 {
            offsets.push(deliveries.recv().await.unwrap().offset());
        }
        assert_eq!(offsets, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(deliveries.lane_count(), 1);
    }

    #[tokio::test]
    async fn test_full_lane_does_not_block_other_lanes() {
        let (mut registry, mut deliveries, _) = test_channel(1, CancellationToken::new());
        let slow = registry.lane(&orders(0));
        let fast = registry.lane(&orders(1));

        slow.send(message(0, 0)).await.unwrap();
        // Lane 0 is full; a second send would wait
        assert!(slow.try_send(message(0, 1)).is_err());

        fast.send(message(1, 0)).await.unwrap();

        let mut partitions = vec![
            deliveries.recv().await.unwrap().partition_number(),
            deliveries.recv().await.unwrap().partition_number(),
        ];
        partitions.sort();
        assert_eq!(partitions, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_offsets_recorded_when_handed_out() {
        let (mut registry, mut deliveries, offsets) = test_channel(4, CancellationToken::new());
        let lane = registry.lane(&orders(0));
        lane.send(message(0, 7)).await.unwrap();
        lane.send(message(0, 8)).await.unwrap();

        // Buffered is not delivered
        assert_eq!(offsets.get(&orders(0)), None);

        assert_eq!(deliveries.recv().await.map(|m| m.offset()), Some(7));
        assert_eq!(offsets.get(&orders(0)), Some(7));
    }

    #[tokio::test]
    async fn test_waits_for_lanes_registered_later() {
        let (mut registry, mut deliveries, _) = test_channel(4, CancellationToken::new());

        let pending = timeout(Duration::from_millis(20), deliveries.recv()).await;
        assert!(pending.is_err(), "empty stream should wait while the session lives");

        let lane = registry.lane(&orders(3));
        lane.send(message(3, 42)).await.unwrap();

        let m = timeout(Duration::from_secs(1), deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.offset(), 42);
    }

    #[tokio::test]
    async fn test_ends_when_registry_and_lanes_are_gone() {
        let (mut registry, mut deliveries, _) = test_channel(4, CancellationToken::new());
        let lane = registry.lane(&orders(0));
        lane.send(message(0, 1)).await.unwrap();
        drop(lane);
        drop(registry);

        assert_eq!(deliveries.recv().await.map(|m| m.offset()), Some(1));
        assert!(deliveries.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_discards_buffered_messages() {
        let shutdown = CancellationToken::new();
        let (mut registry, mut deliveries, offsets) = test_channel(4, shutdown.clone());
        let lane = registry.lane(&orders(0));
        lane.send(message(0, 1)).await.unwrap();

        shutdown.cancel();

        assert!(deliveries.recv().await.is_none());
        assert_eq!(offsets.get(&orders(0)), None);
    }

    #[tokio::test]
    async fn test_lane_opened_after_stream_dropped_is_closed() {
        let (mut registry, deliveries, _) = test_channel(4, CancellationToken::new());
        drop(deliveries);

        let lane = registry.lane(&orders(0));
        assert!(lane.send(message(0, 0)).await.is_err());
    }
}
