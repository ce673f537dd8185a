//! Routes the shared completion event stream to the transactions waiting on it.
//!
//! Every submit registers a single-use waiter keyed by its transaction id before it is sent for
//! ordering. One consumer task reads the event stream in order and resolves waiters as their
//! events arrive. Events nobody is waiting for are remembered for the current block only, so
//! memory is bounded by one block's worth of ids.

use std::{
    collections::{HashMap, HashSet, hash_map::Entry},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::{CompletionEvent, EventStream, LedgerClient, LedgerError, Metrics};

/// Invariant violations raised by the correlator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelatorError {
    /// A waiter already exists for the transaction id.
    #[error("transaction {0} already has a registered event listener")]
    AlreadyRegistered(String),
}

/// What the correlator did with a consumed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// The event resolved a registered waiter.
    Claimed,
    /// The event was already claimed or reported earlier in the same block.
    Duplicate,
    /// No waiter was registered for the event.
    Unclaimed,
}

#[derive(Debug)]
struct Batch {
    block_number: u64,
    claimed: HashSet<String>,
    unclaimed: HashSet<String>,
}

impl Batch {
    fn new(block_number: u64) -> Self {
        Self { block_number, claimed: HashSet::new(), unclaimed: HashSet::new() }
    }
}

#[derive(Debug, Default)]
struct CorrelatorState {
    waiters: HashMap<String, oneshot::Sender<CompletionEvent>>,
    batch: Option<Batch>,
}

/// Matches completion events to registered transaction waiters.
pub struct EventCorrelator {
    state: Mutex<CorrelatorState>,
    listening: AtomicBool,
    start_lock: tokio::sync::Mutex<()>,
    metrics: Metrics,
}

impl fmt::Debug for EventCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCorrelator")
            .field("state", &self.state)
            .field("listening", &self.listening)
            .finish_non_exhaustive()
    }
}

impl EventCorrelator {
    /// Creates a correlator that is not yet listening.
    pub fn new(metrics: Metrics) -> Self {
        Self {
            state: Mutex::new(CorrelatorState::default()),
            listening: AtomicBool::new(false),
            start_lock: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    /// Registers a waiter for `transaction_id`.
    ///
    /// Fails without touching the existing waiter if one is already registered.
    pub fn register(
        &self,
        transaction_id: &str,
    ) -> Result<oneshot::Receiver<CompletionEvent>, CorrelatorError> {
        let mut state = self.state.lock();
        match state.waiters.entry(transaction_id.to_owned()) {
            Entry::Occupied(_) => {
                drop(state);
                error!(txn_id = transaction_id, "duplicate event listener registration");
                debug_assert!(false, "duplicate event listener registration for {transaction_id}");
                Err(CorrelatorError::AlreadyRegistered(transaction_id.to_owned()))
            }
            Entry::Vacant(entry) => {
                let (sender, receiver) = oneshot::channel();
                entry.insert(sender);
                Ok(receiver)
            }
        }
    }

    /// Removes the waiter for `transaction_id`. Unknown ids are ignored.
    pub fn unregister(&self, transaction_id: &str) {
        self.state.lock().waiters.remove(transaction_id);
    }

    /// Returns true if a waiter is registered for `transaction_id`.
    pub fn is_registered(&self, transaction_id: &str) -> bool {
        self.state.lock().waiters.contains_key(transaction_id)
    }

    /// Number of registered waiters.
    pub fn pending_waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Block number of the most recently consumed event.
    pub fn last_block(&self) -> Option<u64> {
        self.state.lock().batch.as_ref().map(|batch| batch.block_number)
    }

    /// Ids seen in `block_number` with no registered waiter, sorted.
    ///
    /// Empty once the correlator has moved past `block_number`.
    pub fn unclaimed(&self, block_number: u64) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .batch
            .as_ref()
            .filter(|batch| batch.block_number == block_number)
            .map(|batch| batch.unclaimed.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Returns true while a consumer task is reading the event stream.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Processes one event: rolls the batch over on a block change, then resolves the
    /// matching waiter or records the id as unclaimed.
    pub fn handle_event(&self, event: CompletionEvent) -> EventDisposition {
        let (disposition, waiter) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if state.batch.as_ref().is_none_or(|batch| batch.block_number != event.block_number) {
                if let Some(previous) = state.batch.replace(Batch::new(event.block_number)) {
                    trace!(
                        previous_block = previous.block_number,
                        block = event.block_number,
                        dropped_unclaimed = previous.unclaimed.len(),
                        "block boundary"
                    );
                }
            }
            let batch = state.batch.get_or_insert_with(|| Batch::new(event.block_number));

            match state.waiters.remove(&event.transaction_id) {
                Some(waiter) => {
                    batch.claimed.insert(event.transaction_id.clone());
                    (EventDisposition::Claimed, Some(waiter))
                }
                None if batch.claimed.contains(&event.transaction_id) => {
                    (EventDisposition::Duplicate, None)
                }
                // Replays after a stream restart are reported once.
                None if batch.unclaimed.insert(event.transaction_id.clone()) => {
                    (EventDisposition::Unclaimed, None)
                }
                None => (EventDisposition::Duplicate, None),
            }
        };

        match disposition {
            EventDisposition::Claimed => {
                let txn_id = event.transaction_id.clone();
                if waiter.is_some_and(|waiter| waiter.send(event).is_err()) {
                    debug!(txn_id = %txn_id, "event listener went away before delivery");
                }
            }
            EventDisposition::Duplicate => {
                trace!(txn_id = %event.transaction_id, block = event.block_number, "duplicate event");
            }
            EventDisposition::Unclaimed => {
                self.metrics.unclaimed_events.increment(1);
                warn!(
                    target: "chaos_client::txn",
                    component = "CLIENT",
                    txn_id = %event.transaction_id,
                    stage = "Failed",
                    block = event.block_number,
                    "event fired, but no listener registered"
                );
            }
        }

        disposition
    }

    /// Reads `events` until the stream ends or fails, then marks the correlator as not
    /// listening. Waiters still pending are left to their own timeouts.
    pub async fn consume(&self, mut events: EventStream) {
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    self.handle_event(event);
                }
                Err(e) => {
                    warn!(error = %e, "completion event stream failed");
                    break;
                }
            }
        }

        drop(events);
        self.listening.store(false, Ordering::Release);
        info!(pending = self.pending_waiters(), "stopped listening for completion events");
    }

    /// Starts the consumer task unless one is already running.
    ///
    /// The subscription resumes from the last block seen so events committed while the
    /// previous stream was down are replayed.
    pub async fn ensure_listening<L: LedgerClient>(
        self: &Arc<Self>,
        ledger: &L,
    ) -> Result<(), LedgerError> {
        if self.is_listening() {
            return Ok(());
        }

        let _guard = self.start_lock.lock().await;
        if self.is_listening() {
            return Ok(());
        }

        let start_block = self.last_block();
        let events = ledger.chaincode_events(start_block).await?;
        self.listening.store(true, Ordering::Release);
        self.metrics.event_stream_starts.increment(1);
        info!(start_block = ?start_block, "listening for completion events");

        let correlator = Arc::clone(self);
        tokio::spawn(async move { correlator.consume(events).await });

        Ok(())
    }
}
