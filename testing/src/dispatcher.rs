//! Scripted dispatcher for driving the state machine through chosen paths.

use notification_relay_core::dispatcher::{DispatchError, Dispatcher};
use notification_relay_core::envelope::Envelope;
use notification_relay_core::event::DomainEvent;
use notification_relay_core::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Script {
    results: VecDeque<Result<(), DispatchError>>,
    calls: Vec<Envelope<DomainEvent>>,
}

/// Dispatcher that returns queued results in order, then succeeds.
///
/// # Example
///
/// ```
/// use notification_relay_core::dispatcher::DispatchError;
/// use notification_relay_testing::ScriptedDispatcher;
///
/// let dispatcher = ScriptedDispatcher::with_results([
///     Err(DispatchError::Transient("smtp down".into())),
///     Ok(()),
/// ]);
/// assert_eq!(dispatcher.call_count(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScriptedDispatcher {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDispatcher {
    /// A dispatcher that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher that plays `results` first.
    #[must_use]
    pub fn with_results(results: impl IntoIterator<Item = Result<(), DispatchError>>) -> Self {
        let dispatcher = Self::new();
        dispatcher.script().results.extend(results);
        dispatcher
    }

    /// A dispatcher that fails transiently `times` times.
    #[must_use]
    pub fn failing_transiently(times: usize) -> Self {
        Self::with_results((0..times).map(|n| Err(DispatchError::Transient(format!("unavailable ({n})")))))
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue another result.
    pub fn push(&self, result: Result<(), DispatchError>) {
        self.script().results.push_back(result);
    }

    /// Every envelope dispatched, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Envelope<DomainEvent>> {
        self.script().calls.clone()
    }

    /// Number of dispatch calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.script().calls.len()
    }
}

impl Dispatcher for ScriptedDispatcher {
    fn dispatch<'a>(&'a self, envelope: &'a Envelope<DomainEvent>) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(async move {
            let mut script = self.script();
            script.calls.push(envelope.clone());
            script.results.pop_front().unwrap_or(Ok(()))
        })
    }
}
