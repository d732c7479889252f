//! Reservation notification service.
//!
//! Consumes reservation lifecycle events and notifies the customer of each
//! one. Retries with backoff through the `{topic}-retry` lane and parks
//! messages that cannot be handled in a dead-letter sink.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod config;
pub mod notification;

pub use app::{ServiceError, run};
pub use config::{Config, ConfigError};
pub use notification::{InMemoryNotificationStore, NotificationDispatcher};
