//! Notification service binary.

use notification_relay_runtime::Shutdown;
use notification_service::{Config, InMemoryNotificationStore};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notification_service=info,notification_relay_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting notification service");

    let config = Config::from_env()?;
    info!(
        brokers = %config.redpanda.brokers,
        consumer_group = %config.consumer.consumer_group,
        topics = ?config.consumer.topics_subscribed,
        "Configuration loaded"
    );

    let shutdown = Arc::new(Shutdown::new());
    let signal_handle = Arc::clone(&shutdown);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, finishing in-flight messages");
                signal_handle.trigger();
            },
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let store = Arc::new(InMemoryNotificationStore::new());
    if let Err(e) = notification_service::run(config, store, shutdown.signal()).await {
        error!(error = %e, "Notification service failed");
        return Err(e.into());
    }

    info!("Notification service shut down gracefully");
    Ok(())
}
