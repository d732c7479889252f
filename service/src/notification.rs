//! Notifications sent for reservation events.
//!
//! [`NotificationDispatcher`] is the service's [`Dispatcher`]: for each event
//! it sends a (mock) email to the customer and records a [`Notification`].

use chrono::{DateTime, Utc};
use notification_relay_core::BoxFuture;
use notification_relay_core::dispatcher::{DispatchError, Dispatcher};
use notification_relay_core::envelope::Envelope;
use notification_relay_core::environment::Clock;
use notification_relay_core::event::DomainEvent;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

/// What a notification announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// Reservation created, awaiting confirmation
    CreatedPending,
    /// Reservation confirmed
    Confirmed,
    /// Reservation cancelled
    Cancelled,
}

impl NotificationKind {
    /// Stored label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::CreatedPending => "CREATED_PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl From<&DomainEvent> for NotificationKind {
    fn from(event: &DomainEvent) -> Self {
        match event {
            DomainEvent::ReservationCreated(_) => Self::CreatedPending,
            DomainEvent::ReservationConfirmed(_) => Self::Confirmed,
            DomainEvent::ReservationCancelled(_) => Self::Cancelled,
        }
    }
}

/// Delivery status of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    /// Handed to the mail transport
    Sent,
}

/// A notification that was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Notification id
    pub id: Uuid,
    /// Message id of the event that caused it
    pub message_id: String,
    /// Reservation concerned
    pub reservation_id: String,
    /// What happened to the reservation
    pub event_type: NotificationKind,
    /// Customer email
    pub recipient: String,
    /// Delivery status
    pub status: NotificationStatus,
    /// When it was sent
    pub sent_at: DateTime<Utc>,
}

/// Notification storage failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached
    #[error("Notification store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence for sent notifications.
pub trait NotificationStore: Send + Sync {
    /// Store a notification.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the notification could not be stored.
    fn save<'a>(&'a self, notification: Notification) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Whether a notification was already recorded for `message_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store could not be queried.
    fn contains_message<'a>(&'a self, message_id: &'a str) -> BoxFuture<'a, Result<bool, StoreError>>;
}

#[derive(Debug, Default)]
struct StoreState {
    notifications: Vec<Notification>,
    unavailable: bool,
}

/// In-memory [`NotificationStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryNotificationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// All stored notifications, in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }

    /// Number of stored notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().notifications.len()
    }

    /// Whether nothing was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NotificationStore for InMemoryNotificationStore {
    fn save<'a>(&'a self, notification: Notification) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.unavailable {
                return Err(StoreError::Unavailable("store offline".to_string()));
            }
            state.notifications.push(notification);
            Ok(())
        })
    }

    fn contains_message<'a>(&'a self, message_id: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let state = self.lock();
            if state.unavailable {
                return Err(StoreError::Unavailable("store offline".to_string()));
            }
            Ok(state.notifications.iter().any(|n| n.message_id == message_id))
        })
    }
}

/// Minimal syntactic check: one `@`, non-empty local part, dotted domain,
/// no whitespace.
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.split('.').count() >= 2
        && domain.split('.').all(|label| !label.is_empty())
}

/// Sends a mock email per event and records it.
///
/// Deduplicates by `message_id`, so redelivered events notify once.
#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
}

impl NotificationDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(store: Arc<dyn NotificationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn send_email(recipient: &str, reservation_id: &str, kind: NotificationKind) {
        tracing::info!(
            to = recipient,
            body = %format!("Update on reservation {reservation_id}: {}", kind.label()),
            "Mock email sent"
        );
    }
}

impl Dispatcher for NotificationDispatcher {
    fn dispatch<'a>(&'a self, envelope: &'a Envelope<DomainEvent>) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(async move {
            let event = &envelope.payload;
            let recipient = event.customer_email();

            if !is_valid_email(recipient) {
                return Err(DispatchError::Permanent(format!(
                    "invalid recipient email {recipient:?}"
                )));
            }

            let seen = self
                .store
                .contains_message(&envelope.message_id)
                .await
                .map_err(|e| DispatchError::Transient(e.to_string()))?;
            if seen {
                tracing::debug!(
                    message_id = %envelope.message_id,
                    "Notification already sent, skipping duplicate"
                );
                return Ok(());
            }

            let kind = NotificationKind::from(event);
            Self::send_email(recipient, event.reservation_id(), kind);

            let notification = Notification {
                id: Uuid::new_v4(),
                message_id: envelope.message_id.clone(),
                reservation_id: event.reservation_id().to_string(),
                event_type: kind,
                recipient: recipient.to_string(),
                status: NotificationStatus::Sent,
                sent_at: self.clock.now(),
            };

            self.store
                .save(notification)
                .await
                .map_err(|e| DispatchError::Transient(e.to_string()))?;

            tracing::info!(
                message_id = %envelope.message_id,
                reservation_id = event.reservation_id(),
                event_type = kind.label(),
                "Notification recorded"
            );
            Ok(())
        })
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use notification_relay_core::event::ReservationDetails;
    use notification_relay_testing::test_clock;

    fn envelope(message_id: &str, event: DomainEvent) -> Envelope<DomainEvent> {
        Envelope {
            message_id: message_id.to_string(),
            event_type: event.event_type().to_string(),
            timestamp: test_clock().now(),
            correlation_id: None,
            causation_id: None,
            payload: event,
        }
    }

    fn dispatcher() -> (NotificationDispatcher, InMemoryNotificationStore) {
        let store = InMemoryNotificationStore::new();
        let dispatcher = NotificationDispatcher::new(Arc::new(store.clone()), Arc::new(test_clock()));
        (dispatcher, store)
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("a@b.com"));
        assert!(is_valid_email("first.last@mail.example.org"));
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("@b.com"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a@b..com"));
        assert!(!is_valid_email("a@@b.com"));
        assert!(!is_valid_email("a b@c.com"));
    }

    #[test]
    fn kind_labels() {
        let details = ReservationDetails::new("r1", "a@b.com");
        assert_eq!(
            NotificationKind::from(&DomainEvent::ReservationCreated(details.clone())).label(),
            "CREATED_PENDING"
        );
        assert_eq!(
            NotificationKind::from(&DomainEvent::ReservationConfirmed(details.clone())).label(),
            "CONFIRMED"
        );
        assert_eq!(
            NotificationKind::from(&DomainEvent::ReservationCancelled(details)).label(),
            "CANCELLED"
        );
    }

    #[tokio::test]
    async fn records_notification() {
        let (dispatcher, store) = dispatcher();
        let env = envelope(
            "m1",
            DomainEvent::ReservationConfirmed(ReservationDetails::new("r1", "a@b.com")),
        );

        dispatcher.dispatch(&env).await.unwrap();

        let stored = store.all();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message_id, "m1");
        assert_eq!(stored[0].reservation_id, "r1");
        assert_eq!(stored[0].event_type, NotificationKind::Confirmed);
        assert_eq!(stored[0].status, NotificationStatus::Sent);
        assert_eq!(stored[0].sent_at, test_clock().now());
    }

    #[tokio::test]
    async fn duplicate_delivery_notifies_once() {
        let (dispatcher, store) = dispatcher();
        let env = envelope(
            "m1",
            DomainEvent::ReservationCreated(ReservationDetails::new("r1", "a@b.com")),
        );

        dispatcher.dispatch(&env).await.unwrap();
        dispatcher.dispatch(&env).await.unwrap();

        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn invalid_email_is_permanent() {
        let (dispatcher, store) = dispatcher();
        let env = envelope(
            "m1",
            DomainEvent::ReservationCancelled(ReservationDetails::new("r1", "not-an-email")),
        );

        let err = dispatcher.dispatch(&env).await.unwrap_err();
        assert!(matches!(err, DispatchError::Permanent(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn store_outage_is_transient() {
        let (dispatcher, store) = dispatcher();
        store.set_unavailable(true);
        let env = envelope(
            "m1",
            DomainEvent::ReservationCreated(ReservationDetails::new("r1", "a@b.com")),
        );

        let err = dispatcher.dispatch(&env).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transient(_)));

        store.set_unavailable(false);
        dispatcher.dispatch(&env).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
