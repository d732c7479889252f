//! Wiring of the notification service.

use crate::config::{Config, ConfigError, DeadLetterBackend};
use crate::notification::{NotificationDispatcher, NotificationStore};
use notification_relay_core::dead_letter::DeadLetterSink;
use notification_relay_core::environment::{Clock, SystemClock};
use notification_relay_core::transport::{RetryScheduler, TransportError};
use notification_relay_postgres::{PostgresDeadLetterSink, PostgresError};
use notification_relay_redpanda::KafkaMessageBus;
use notification_relay_runtime::metrics::{MetricsError, MetricsServer};
use notification_relay_runtime::{
    ConsumerRuntime, ConsumerSettings, MessageProcessor, RetryPolicy, RuntimeError, ShutdownSignal,
};
use std::sync::Arc;
use thiserror::Error;

/// Errors that stop the service.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration is incomplete for the chosen setup
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Metrics exporter failed to start
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// Broker client could not be created
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Dead-letter database could not be prepared
    #[error(transparent)]
    Postgres(#[from] PostgresError),

    /// The consumer stopped abnormally
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Build the message processor that turns reservation events into
/// notifications.
#[must_use]
pub fn notification_processor(
    store: Arc<dyn NotificationStore>,
    sink: Arc<dyn DeadLetterSink>,
    scheduler: Arc<dyn RetryScheduler>,
    settings: &ConsumerSettings,
    clock: Arc<dyn Clock>,
) -> MessageProcessor {
    let dispatcher = Arc::new(NotificationDispatcher::new(store, Arc::clone(&clock)));
    MessageProcessor::new(
        dispatcher,
        sink,
        scheduler,
        RetryPolicy::from_config(settings),
        clock,
    )
}

/// Open the configured dead-letter sink.
///
/// # Errors
///
/// - [`ServiceError::Config`]: the postgres backend has no `DATABASE_URL`
/// - [`ServiceError::Postgres`]: the database cannot be reached or its
///   schema cannot be created
pub async fn dead_letter_sink(
    config: &Config,
    bus: &KafkaMessageBus,
) -> Result<Arc<dyn DeadLetterSink>, ServiceError> {
    match (config.dead_letter.backend, config.dead_letter.database_url.as_deref()) {
        (DeadLetterBackend::Kafka, _) => {
            tracing::info!("Dead letters go to {{topic}}-dlt");
            Ok(Arc::new(bus.dead_letter_sink()))
        },
        (DeadLetterBackend::Postgres, Some(url)) => {
            let sink = PostgresDeadLetterSink::connect(url).await?;
            sink.ensure_schema().await?;
            tracing::info!("Dead letters go to PostgreSQL");
            Ok(Arc::new(sink))
        },
        (DeadLetterBackend::Postgres, None) => Err(ConfigError::Missing("DATABASE_URL").into()),
    }
}

/// Run the service until `shutdown` fires or the subscription ends.
///
/// # Errors
///
/// Returns [`ServiceError`] if a collaborator cannot be set up or the
/// consumer stops abnormally.
pub async fn run(
    config: Config,
    store: Arc<dyn NotificationStore>,
    shutdown: ShutdownSignal,
) -> Result<(), ServiceError> {
    let mut metrics = MetricsServer::new(config.metrics_addr);
    metrics.start()?;

    let settings = config.consumer_settings();

    tracing::info!(brokers = %config.redpanda.brokers, "Connecting to Redpanda...");
    let bus = KafkaMessageBus::builder()
        .brokers(config.redpanda.brokers.clone())
        .consumer_group(settings.consumer_group.clone())
        .build()?;

    let sink = dead_letter_sink(&config, &bus).await?;
    let scheduler: Arc<dyn RetryScheduler> = Arc::new(bus.retry_scheduler());
    let processor = notification_processor(store, sink, scheduler, &settings, Arc::new(SystemClock));

    tracing::info!(
        topics = ?settings.subscription_topics(),
        max_attempts = settings.max_attempts,
        dead_letter_backend = %config.dead_letter.backend,
        "Starting consumer"
    );

    let runtime = ConsumerRuntime::new(Arc::new(bus), processor, settings);
    runtime.run(shutdown).await?;
    Ok(())
}
