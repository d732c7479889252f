//! # Notification Relay Runtime
//!
//! Drives the consumption pipeline on top of the capability traits from
//! `notification-relay-core`.
//!
//! ## Core Components
//!
//! - **Retry policy**: bounded exponential backoff ([`retry`])
//! - **Message processor**: the per-attempt state machine ([`consumer`])
//! - **Consumer runtime**: per-partition workers, routing and graceful
//!   shutdown ([`worker`])
//! - **Metrics**: Prometheus exporter and recorders ([`metrics`])
//!
//! ## Example
//!
//! ```ignore
//! use notification_relay_runtime::consumer::MessageProcessor;
//! use notification_relay_runtime::retry::RetryPolicy;
//! use notification_relay_runtime::worker::{ConsumerRuntime, ConsumerSettings, Shutdown};
//!
//! let settings = ConsumerSettings::builder()
//!     .topics(["reservation-created", "reservation-confirmed"])
//!     .build();
//! let processor = MessageProcessor::new(
//!     dispatcher,
//!     dead_letter_sink,
//!     retry_scheduler,
//!     RetryPolicy::from_config(&settings),
//!     clock,
//! );
//!
//! let shutdown = Shutdown::new();
//! let runtime = ConsumerRuntime::new(bus, processor, settings);
//! runtime.run(shutdown.signal()).await?;
//! ```

/// Per-attempt consumption state machine
pub mod consumer;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry policy with exponential backoff
pub mod retry;

/// Partition workers and the consumer runtime
pub mod worker;

/// Error types for the consumer runtime
pub mod error {
    use notification_relay_core::transport::TransportError;
    use thiserror::Error;

    /// Errors that end [`ConsumerRuntime::run`](crate::worker::ConsumerRuntime::run).
    ///
    /// Per-message failures never surface here: they are settled by the
    /// state machine.
    #[derive(Error, Debug)]
    pub enum RuntimeError {
        /// No topics configured
        #[error("No topics to subscribe to")]
        NoTopics,

        /// The bus refused the subscription
        #[error("Subscription failed: {0}")]
        Subscription(#[from] TransportError),

        /// Workers were still busy when the shutdown timeout elapsed
        ///
        /// Their in-flight messages were left unacknowledged.
        #[error("Shutdown timed out with {0} partition workers still running")]
        ShutdownTimeout(usize),
    }
}

pub use consumer::{ConsumptionState, MessageProcessor, Outcome, ProcessingReport};
pub use error::RuntimeError;
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{ConsumerRuntime, ConsumerSettings, PartitionWorker, Shutdown, ShutdownSignal};
