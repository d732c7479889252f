//! The consumption state machine.
//!
//! One [`MessageProcessor::process`] call handles one delivery attempt of one
//! message:
//!
//! ```text
//! Received ──▶ Normalizing ──▶ Dispatching ──▶ Acknowledged
//!                   │               │
//!                   │               ├──▶ RetryScheduled (transient, budget left)
//!                   ▼               ▼
//!              DeadLettered ◀── DeadLettered (permanent, or budget spent)
//! ```
//!
//! Decode and normalization failures are permanent and never retried. A
//! transient dispatch failure is handed to the retry lane with the next
//! attempt number and a not-before instant, after which the source message
//! can be acknowledged. If the dead-letter sink or the retry lane cannot
//! take the message, the outcome is [`Outcome::Unacknowledged`] and the
//! transport redelivers it.

use crate::metrics::ConsumerMetrics;
use crate::retry::{RetryDecision, RetryPolicy};
use notification_relay_core::attempt::DeliveryAttempt;
use notification_relay_core::dead_letter::{DeadLetterRecord, DeadLetterSink};
use notification_relay_core::dispatcher::Dispatcher;
use notification_relay_core::envelope::Envelope;
use notification_relay_core::environment::Clock;
use notification_relay_core::error::{ErrorKind, ProcessingFailure};
use notification_relay_core::event::normalize;
use notification_relay_core::transport::{InboundMessage, RetryScheduler};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// States a delivery attempt passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumptionState {
    /// Raw bytes arrived
    Received,
    /// Parsing the envelope and normalising the payload
    Normalizing,
    /// Invoking the dispatcher
    Dispatching,
    /// Terminal: processed successfully
    Acknowledged,
    /// Terminal for this attempt: handed to the retry lane
    RetryScheduled,
    /// Terminal: written to the dead-letter sink
    DeadLettered,
}

impl ConsumptionState {
    /// Whether this state ends the attempt.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::RetryScheduled | Self::DeadLettered)
    }
}

impl fmt::Display for ConsumptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "Received",
            Self::Normalizing => "Normalizing",
            Self::Dispatching => "Dispatching",
            Self::Acknowledged => "Acknowledged",
            Self::RetryScheduled => "RetryScheduled",
            Self::DeadLettered => "DeadLettered",
        };
        f.write_str(name)
    }
}

/// How a delivery attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The dispatcher succeeded.
    Acknowledged,
    /// A redelivery was durably scheduled on the retry lane.
    RetryScheduled {
        /// Attempt number of the redelivery
        next_attempt: u32,
        /// Backoff before the redelivery may run
        delay: Duration,
    },
    /// A dead-letter record was durably written.
    DeadLettered {
        /// Kind of the final failure
        kind: ErrorKind,
        /// Attempts made, including this one
        attempts_made: u32,
    },
    /// Neither the sink nor the retry lane accepted the message; it must be
    /// redelivered by the transport.
    Unacknowledged {
        /// Why the message could not be settled
        reason: String,
    },
}

impl Outcome {
    /// Whether the transport may move past the message.
    #[must_use]
    pub const fn should_acknowledge(&self) -> bool {
        !matches!(self, Self::Unacknowledged { .. })
    }
}

/// Everything that happened to one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingReport {
    /// Message id, if the envelope parsed
    pub message_id: Option<String>,
    /// Attempt number of this delivery
    pub attempt: u32,
    /// States visited, in order
    pub transitions: Vec<ConsumptionState>,
    /// How the attempt ended
    pub outcome: Outcome,
}

impl ProcessingReport {
    /// The last state reached.
    #[must_use]
    pub fn final_state(&self) -> Option<ConsumptionState> {
        self.transitions.last().copied()
    }
}

/// Drives one delivery attempt through the state machine.
///
/// Holds no per-message state and is shared by all partition workers.
#[derive(Clone)]
pub struct MessageProcessor {
    dispatcher: Arc<dyn Dispatcher>,
    sink: Arc<dyn DeadLetterSink>,
    scheduler: Arc<dyn RetryScheduler>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl MessageProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        sink: Arc<dyn DeadLetterSink>,
        scheduler: Arc<dyn RetryScheduler>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dispatcher,
            sink,
            scheduler,
            policy,
            clock,
        }
    }

    /// The retry policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The clock in use.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Process one delivery attempt.
    ///
    /// Never fails: every failure is folded into the report's [`Outcome`].
    #[tracing::instrument(
        skip(self, message),
        name = "process_message",
        fields(topic = %message.topic, partition = message.partition, offset = message.offset)
    )]
    pub async fn process(&self, message: &InboundMessage) -> ProcessingReport {
        let attempt = message.attempt(self.clock.now());
        let mut transitions = vec![ConsumptionState::Received, ConsumptionState::Normalizing];
        ConsumerMetrics::record_received(&message.topic);

        let envelope = match Envelope::parse(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                return self
                    .dead_letter(message, None, &attempt, err.into(), transitions)
                    .await;
            },
        };
        let message_id = Some(envelope.message_id.clone());

        let event = match normalize(envelope) {
            Ok(event) => event,
            Err(err) => {
                return self
                    .dead_letter(message, message_id, &attempt, err.into(), transitions)
                    .await;
            },
        };

        transitions.push(ConsumptionState::Dispatching);
        let started = Instant::now();
        let result = self.dispatcher.dispatch(&event).await;
        ConsumerMetrics::record_dispatch(started.elapsed(), result.as_ref().err().map(|e| e.kind()));

        let failure = match result {
            Ok(()) => {
                tracing::info!(
                    message_id = %event.message_id,
                    event_type = %event.event_type,
                    attempt = attempt.attempt_number,
                    "Message dispatched"
                );
                transitions.push(ConsumptionState::Acknowledged);
                return ProcessingReport {
                    message_id,
                    attempt: attempt.attempt_number,
                    transitions,
                    outcome: Outcome::Acknowledged,
                };
            },
            Err(err) => ProcessingFailure::from(err),
        };

        match self.policy.decide(attempt.attempt_number, failure.kind) {
            RetryDecision::Retry(delay) => {
                self.schedule_retry(message, message_id, &attempt, failure, delay, transitions)
                    .await
            },
            RetryDecision::Escalate => {
                self.dead_letter(message, message_id, &attempt, failure, transitions)
                    .await
            },
        }
    }

    async fn schedule_retry(
        &self,
        message: &InboundMessage,
        message_id: Option<String>,
        attempt: &DeliveryAttempt,
        failure: ProcessingFailure,
        delay: Duration,
        mut transitions: Vec<ConsumptionState>,
    ) -> ProcessingReport {
        let now = self.clock.now();
        let not_before = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        let next = attempt.next(failure.to_string(), not_before);

        let outcome = match self.scheduler.schedule(message, &next).await {
            Ok(()) => {
                tracing::warn!(
                    message_id = ?message_id,
                    attempt = attempt.attempt_number,
                    next_attempt = next.attempt_number,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %failure,
                    "Dispatch failed, retry scheduled"
                );
                ConsumerMetrics::record_retry_scheduled(message.source_topic(), delay);
                transitions.push(ConsumptionState::RetryScheduled);
                Outcome::RetryScheduled {
                    next_attempt: next.attempt_number,
                    delay,
                }
            },
            Err(err) => {
                tracing::error!(
                    message_id = ?message_id,
                    attempt = attempt.attempt_number,
                    error = %err,
                    dispatch_error = %failure,
                    "Failed to schedule retry, leaving message unacknowledged"
                );
                Outcome::Unacknowledged {
                    reason: err.to_string(),
                }
            },
        };

        ProcessingReport {
            message_id,
            attempt: attempt.attempt_number,
            transitions,
            outcome,
        }
    }

    async fn dead_letter(
        &self,
        message: &InboundMessage,
        message_id: Option<String>,
        attempt: &DeliveryAttempt,
        failure: ProcessingFailure,
        mut transitions: Vec<ConsumptionState>,
    ) -> ProcessingReport {
        let record = DeadLetterRecord::new(
            message.payload.clone(),
            message.source_topic(),
            &failure,
            attempt.attempt_number,
            self.clock.now(),
        )
        .with_message_id(message_id.clone());

        let outcome = match self.sink.write(&record).await {
            Ok(()) => {
                tracing::warn!(
                    message_id = ?message_id,
                    source_topic = %record.source_topic,
                    attempts_made = record.attempts_made,
                    error_kind = %failure.kind,
                    error = %failure.message,
                    "Message dead-lettered"
                );
                ConsumerMetrics::record_dead_lettered(&record.source_topic, failure.kind);
                transitions.push(ConsumptionState::DeadLettered);
                Outcome::DeadLettered {
                    kind: failure.kind,
                    attempts_made: record.attempts_made,
                }
            },
            Err(err) => {
                tracing::error!(
                    message_id = ?message_id,
                    source_topic = %record.source_topic,
                    error = %err,
                    dead_letter_reason = %failure,
                    "Dead-letter write failed, leaving message unacknowledged"
                );
                Outcome::Unacknowledged {
                    reason: err.to_string(),
                }
            },
        };

        ProcessingReport {
            message_id,
            attempt: attempt.attempt_number,
            transitions,
            outcome,
        }
    }
}

impl fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
