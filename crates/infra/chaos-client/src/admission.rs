//! In-flight transaction accounting.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Minimum admission ceiling (never stop completely).
const MIN_CEILING: usize = 1;

/// Counts in-flight transactions and enforces the admission ceiling.
///
/// The ceiling is a semaphore. Cloning shares both the semaphore and the in-flight count.
/// Each admitted transaction holds an [`AdmissionPermit`] which releases its slot when
/// dropped.
#[derive(Debug, Clone)]
pub struct AdmissionLimiter {
    hard_limit: Arc<Semaphore>,
    /// Admitted plus directly run transactions.
    in_flight: Arc<AtomicUsize>,
    ceiling: usize,
}

impl AdmissionLimiter {
    /// Creates a limiter admitting at most `ceiling` concurrent transactions.
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(MIN_CEILING);
        Self {
            hard_limit: Arc::new(Semaphore::new(ceiling)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            ceiling,
        }
    }

    /// Takes a slot if the in-flight count is below the ceiling.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        if self.in_flight.load(Ordering::Acquire) >= self.ceiling {
            return None;
        }

        let permit = Arc::clone(&self.hard_limit).try_acquire_owned().ok()?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        Some(AdmissionPermit { in_flight: Arc::clone(&self.in_flight), _permit: Some(permit) })
    }

    /// Takes a slot regardless of the ceiling.
    ///
    /// Used when a transaction is run directly rather than through the driver, so it still
    /// shows up in the in-flight count.
    pub fn acquire(&self) -> AdmissionPermit {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        AdmissionPermit { in_flight: Arc::clone(&self.in_flight), _permit: None }
    }

    /// Returns the current number of in-flight transactions.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Returns the admission ceiling.
    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }
}

/// RAII guard that releases an in-flight slot on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    in_flight: Arc<AtomicUsize>,
    /// Held for admitted transactions, `None` for direct runs.
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
