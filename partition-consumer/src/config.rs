use std::time::Duration;

use anyhow::{bail, Context, Result};
use envconfig::Envconfig;

use crate::broker::{KafkaBroker, KafkaClientConfigBuilder};
use crate::session::SessionConfig;
use crate::types::{StartOffset, TopicPartition};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "partition-consumer")]
    pub kafka_client_id: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    // Comma separated partition numbers
    #[envconfig(default = "0")]
    pub kafka_consumer_partitions: String,

    // earliest, latest or a numeric offset
    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "10000")]
    pub metadata_timeout_ms: u64,

    // Session configuration
    #[envconfig(default = "100")]
    pub delivery_buffer_size: usize,

    #[envconfig(default = "5000")]
    pub shutdown_grace_ms: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Check every value that envconfig cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        if self.kafka_hosts.trim().is_empty() {
            bail!("KAFKA_HOSTS must not be empty");
        }
        if self.kafka_consumer_topic.trim().is_empty() {
            bail!("KAFKA_CONSUMER_TOPIC must not be empty");
        }
        if self.delivery_buffer_size == 0 {
            bail!("DELIVERY_BUFFER_SIZE must be at least 1");
        }
        if self.metadata_timeout_ms == 0 {
            bail!("METADATA_TIMEOUT_MS must be at least 1");
        }
        self.partitions()?;
        self.start_offset()?;
        Ok(())
    }

    /// Partitions of the consumer topic to subscribe, deduplicated and sorted
    pub fn partitions(&self) -> Result<Vec<TopicPartition>> {
        let mut numbers = Vec::new();
        for part in self.kafka_consumer_partitions.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let number: i32 = part.parse().with_context(|| {
                format!("invalid partition number '{part}' in KAFKA_CONSUMER_PARTITIONS")
            })?;
            if number < 0 {
                bail!("partition numbers must be non-negative, got {number}");
            }
            numbers.push(number);
        }
        numbers.sort_unstable();
        numbers.dedup();

        if numbers.is_empty() {
            bail!("KAFKA_CONSUMER_PARTITIONS must name at least one partition");
        }

        Ok(numbers
            .into_iter()
            .map(|number| TopicPartition::new(self.kafka_consumer_topic.clone(), number))
            .collect())
    }

    pub fn start_offset(&self) -> Result<StartOffset> {
        self.kafka_consumer_offset_reset
            .parse()
            .context("invalid KAFKA_CONSUMER_OFFSET_RESET")
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_delivery_buffer_size(self.delivery_buffer_size)
            .with_shutdown_grace(self.shutdown_grace())
    }

    /// Build the rdkafka-backed broker client
    pub fn kafka_broker(&self) -> KafkaBroker {
        let builder = KafkaClientConfigBuilder::default()
            .with_tls(self.kafka_tls)
            .with_client_id(&self.kafka_client_id);
        KafkaBroker::from_builder(builder, self.metadata_timeout())
    }
}
