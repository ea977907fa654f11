use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use partition_consumer::config::Config;
use partition_consumer::metrics_server::{router, serve, setup_metrics_recorder};
use partition_consumer::ConsumerSession;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let handle = setup_metrics_recorder()?;
    let router = router(handle);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Metrics server stopped: {e:#}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    info!("Starting partition consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    config.validate().context("Invalid configuration")?;

    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let broker = Arc::new(config.kafka_broker());
    let session = ConsumerSession::connect(
        broker,
        config.kafka_hosts.as_str(),
        config.session_config(),
    )
    .await
    .with_context(|| format!("Failed to connect to Kafka at {}", config.kafka_hosts))?;

    let start = config.start_offset()?;
    for partition in config.partitions()? {
        session
            .subscribe(partition.clone(), start)
            .await
            .with_context(|| format!("Failed to subscribe to {partition}"))?;
        info!(%partition, %start, "Subscribed");
    }

    let mut deliveries = session
        .deliveries()
        .context("delivery stream already taken")?;
    let mut failures = session.failures().context("failure stream already taken")?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for ctrl+c signal: {e:#}");
                }
                info!("Received shutdown signal, shutting down gracefully...");
                break;
            }

            Some(failure) = failures.recv() => {
                error!(
                    partition = %failure.partition,
                    last_delivered = ?failure.last_delivered,
                    error = ?failure.error,
                    "Partition stopped after a read error"
                );
            }

            message = deliveries.recv() => {
                let Some(message) = message else {
                    info!("Delivery stream ended");
                    break;
                };
                info!(
                    partition = %message.partition(),
                    offset = message.offset(),
                    bytes = message.value().len(),
                    "Received message"
                );
                debug!(value = %String::from_utf8_lossy(message.value()), "Message value");
            }
        }
    }

    session.close().await;
    server_handle.abort();

    info!("Partition consumer stopped");
    Ok(())
}
