//! Single-partition Kafka consumer core.
//!
//! A [`ConsumerSession`] owns one broker connection and a set of
//! [`PartitionReader`]s. Every subscribed partition is forwarded by its own
//! task into a bounded lane, and all lanes are merged into one
//! [`Deliveries`] stream for the caller.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use
//! formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` for the full chain on one line.
//! - **Structured field:** `error = ?e` for the full chain with `Caused by:` sections.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the
//! original error remains the source.

pub mod broker;
pub mod config;
pub mod delivery;
pub mod error;
pub mod metrics_consts;
pub mod metrics_server;
pub mod offset_tracker;
pub mod reader;
pub mod session;
pub mod types;

// Re-export commonly used types for convenience
pub use broker::{BrokerClient, KafkaBroker, MemoryBroker};
pub use delivery::Deliveries;
pub use error::{ConnectionError, ReadError, SubscriptionError};
pub use reader::{PartitionReader, ReaderStatus};
pub use session::{ConsumerSession, ReaderFailure, SessionConfig, SessionState};
pub use types::{BrokerAddress, ConsumedMessage, StartOffset, TopicPartition};
