//! In-memory dead-letter sink with an outage switch.

use notification_relay_core::dead_letter::{DeadLetterRecord, DeadLetterSink, SinkWriteError};
use notification_relay_core::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Dead-letter sink that keeps records in memory.
///
/// Clones share storage, so a test can keep a handle while the pipeline owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterSink {
    records: Arc<Mutex<Vec<DeadLetterRecord>>>,
    unavailable: Arc<AtomicBool>,
    write_attempts: Arc<AtomicUsize>,
}

impl InMemoryDeadLetterSink {
    /// Create an empty, available sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with [`SinkWriteError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Stored records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes attempted, including failed ones.
    #[must_use]
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn write<'a>(&'a self, record: &'a DeadLetterRecord) -> BoxFuture<'a, Result<(), SinkWriteError>> {
        Box::pin(async move {
            self.write_attempts.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(SinkWriteError::Unavailable("in-memory sink switched off".to_string()));
            }
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record.clone());
            Ok(())
        })
    }
}
