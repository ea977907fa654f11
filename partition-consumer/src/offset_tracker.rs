//! Delivered Offsets - Tracks the last offset handed to the caller per partition
//!
//! Forwarding tasks record every message that made it into the delivery
//! stream. Callers that reopen a failed partition use the recorded offset to
//! resume at `last + 1`. Nothing here is persisted.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::metrics_consts::DELIVERED_OFFSET_REGRESSION;
use crate::types::TopicPartition;

/// Thread-safe map of partition to last delivered offset
#[derive(Default)]
pub struct DeliveredOffsets {
    partitions: DashMap<TopicPartition, i64>,
}

impl DeliveredOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivered offset. Offsets only move forward; a lower or equal
    /// offset is logged and counted but not stored.
    pub fn mark_delivered(&self, partition: &TopicPartition, offset: i64) {
        self.partitions
            .entry(partition.clone())
            .and_modify(|last| {
                if offset <= *last {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset,
                        last_delivered = *last,
                        "Delivered offset did not advance"
                    );
                    metrics::counter!(
                        DELIVERED_OFFSET_REGRESSION,
                        "topic" => partition.topic().to_string(),
                        "partition" => partition.partition_number().to_string()
                    )
                    .increment(1);
                } else {
                    *last = offset;
                }
            })
            .or_insert_with(|| {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset,
                    "First delivery for partition"
                );
                offset
            });
    }

    pub fn get(&self, partition: &TopicPartition) -> Option<i64> {
        self.partitions.get(partition).map(|entry| *entry.value())
    }

    /// Snapshot of every tracked partition
    pub fn snapshot(&self) -> HashMap<TopicPartition, i64> {
        self.partitions
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Forget a partition, e.g. before a new reader starts a fresh sequence
    pub fn clear_partition(&self, partition: &TopicPartition) {
        if self.partitions.remove(partition).is_some() {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Cleared delivered offset"
            );
        }
    }
}
