use thiserror::Error;

use crate::types::{BrokerAddress, StartOffset, TopicPartition};

/// Opening a session failed. Not retried internally.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("invalid broker address '{0}'")]
    InvalidAddress(BrokerAddress),

    #[error("broker {address} unreachable: {reason}")]
    Unreachable {
        address: BrokerAddress,
        reason: String,
    },

    #[error("handshake with broker {address} failed: {reason}")]
    Handshake {
        address: BrokerAddress,
        reason: String,
    },
}

/// A single subscribe call failed. The session stays usable.
#[derive(Error, Debug, Clone)]
pub enum SubscriptionError {
    #[error("partition {0} does not exist")]
    UnknownPartition(TopicPartition),

    #[error("broker rejected start offset {offset} for {partition}: {reason}")]
    OffsetRejected {
        partition: TopicPartition,
        offset: StartOffset,
        reason: String,
    },

    #[error("partition {0} already has an active reader")]
    AlreadySubscribed(TopicPartition),

    #[error("session is closing or closed")]
    SessionClosed,

    #[error("broker connection is closed")]
    ConnectionClosed,

    #[error("broker error while subscribing to {partition}: {reason}")]
    Broker {
        partition: TopicPartition,
        reason: String,
    },
}

/// An active reader stopped producing messages. Surfaced once per failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadError {
    #[error("connection lost while reading {partition}: {reason}")]
    ConnectionLost {
        partition: TopicPartition,
        reason: String,
    },

    #[error("failed to decode message at {partition} offset {offset}: {reason}")]
    Decode {
        partition: TopicPartition,
        offset: i64,
        reason: String,
    },

    #[error("broker error while reading {partition}: {reason}")]
    Broker {
        partition: TopicPartition,
        reason: String,
    },
}

impl ReadError {
    pub fn partition(&self) -> &TopicPartition {
        match self {
            ReadError::ConnectionLost { partition, .. }
            | ReadError::Decode { partition, .. }
            | ReadError::Broker { partition, .. } => partition,
        }
    }

    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            ReadError::ConnectionLost { .. } => "connection_lost",
            ReadError::Decode { .. } => "decode",
            ReadError::Broker { .. } => "broker",
        }
    }
}

impl SubscriptionError {
    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            SubscriptionError::UnknownPartition(_) => "unknown_partition",
            SubscriptionError::OffsetRejected { .. } => "offset_rejected",
            SubscriptionError::AlreadySubscribed(_) => "already_subscribed",
            SubscriptionError::SessionClosed => "session_closed",
            SubscriptionError::ConnectionClosed => "connection_closed",
            SubscriptionError::Broker { .. } => "broker",
        }
    }
}
