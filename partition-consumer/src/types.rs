use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Connection string for a broker endpoint, e.g. `localhost:9092`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerAddress(String);

impl BrokerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BrokerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for BrokerAddress {
    fn from(address: String) -> Self {
        Self::new(address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    topic: String,
    partition_number: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// Where a new subscription starts reading.
///
/// The sentinels are resolved against the broker exactly once, when the
/// subscription is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartOffset {
    Earliest,
    Latest,
    At(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid start offset '{0}': expected earliest, latest or a non-negative offset")]
pub struct ParseStartOffsetError(String);

impl FromStr for StartOffset {
    type Err = ParseStartOffsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "oldest" | "beginning" => Ok(StartOffset::Earliest),
            "latest" | "newest" | "end" => Ok(StartOffset::Latest),
            other => match other.parse::<i64>() {
                Ok(offset) if offset >= 0 => Ok(StartOffset::At(offset)),
                _ => Err(ParseStartOffsetError(s.to_string())),
            },
        }
    }
}

impl fmt::Display for StartOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartOffset::Earliest => f.write_str("earliest"),
            StartOffset::Latest => f.write_str("latest"),
            StartOffset::At(offset) => write!(f, "{offset}"),
        }
    }
}

/// A record as handed over by the broker client, before it is bound to a
/// partition and checked for ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A message delivered to the caller. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    partition: TopicPartition,
    offset: i64,
    key: Option<Bytes>,
    value: Bytes,
    timestamp: Option<DateTime<Utc>>,
}

impl ConsumedMessage {
    pub fn new(
        partition: TopicPartition,
        offset: i64,
        key: Option<Bytes>,
        value: Bytes,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            value,
            timestamp,
        }
    }

    pub(crate) fn from_raw(partition: TopicPartition, raw: RawMessage) -> Self {
        Self {
            partition,
            offset: raw.offset,
            key: raw.key,
            // Null payloads (tombstones) surface as empty values
            value: raw.payload.unwrap_or_default(),
            timestamp: raw.timestamp,
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Consume the message, returning its key and value buffers
    pub fn into_parts(self) -> (Option<Bytes>, Bytes) {
        (self.key, self.value)
    }
}
