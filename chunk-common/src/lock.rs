use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{LockStore, StoreError};

/// Enumeration of errors for ProcessingLock operations.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("file processing is already locked")]
    AlreadyLocked,
    #[error("file processing is not locked")]
    NoActiveLock,
    #[error(transparent)]
    StoreError(#[from] StoreError),
}

/// The outcome of trying to take the processing lock.
/// Contention is an expected result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    Acquired { lock_time: DateTime<Utc> },
    AlreadyHeld,
}

impl Acquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquisition::Acquired { .. })
    }
}

/// The single, global lock serializing the chunking pipeline across every worker process.
///
/// Its state lives in the backing store, never in process memory, so independent workers observe
/// the same lock. The lock never expires on its own: `age` lets callers spot a holder that crashed
/// and decide what to do about it.
#[derive(Clone)]
pub struct ProcessingLock<S> {
    store: S,
}

impl<S: LockStore> ProcessingLock<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Take the lock if nobody holds it. The check and the set are one store operation, so of
    /// any number of concurrent callers at most one is told `Acquired`.
    pub async fn try_acquire(&self) -> Result<Acquisition, LockError> {
        match self.store.insert_lock_if_absent(Utc::now()).await? {
            Some(lock_time) => {
                metrics::gauge!("processing_lock_held").set(1.0);
                info!(%lock_time, "acquired processing lock");
                Ok(Acquisition::Acquired { lock_time })
            }
            None => {
                metrics::counter!("processing_lock_contended_total").increment(1);
                debug!("processing lock is already held");
                Ok(Acquisition::AlreadyHeld)
            }
        }
    }

    /// Like `try_acquire`, but reports contention as `LockError::AlreadyLocked`.
    pub async fn acquire(&self) -> Result<DateTime<Utc>, LockError> {
        match self.try_acquire().await? {
            Acquisition::Acquired { lock_time } => Ok(lock_time),
            Acquisition::AlreadyHeld => Err(LockError::AlreadyLocked),
        }
    }

    /// Clear the lock. Releasing a lock nobody holds is a no-op.
    pub async fn release(&self) -> Result<(), LockError> {
        let deleted = self.store.delete_lock().await?;
        metrics::gauge!("processing_lock_held").set(0.0);
        if deleted > 0 {
            info!("released processing lock");
        }
        Ok(())
    }

    pub async fn is_locked(&self) -> Result<bool, LockError> {
        Ok(self.store.current_lock_time().await?.is_some())
    }

    pub async fn lock_time(&self) -> Result<Option<DateTime<Utc>>, LockError> {
        Ok(self.store.current_lock_time().await?)
    }

    /// Time elapsed since the current holder took the lock.
    pub async fn age(&self) -> Result<Duration, LockError> {
        let lock_time = self
            .store
            .current_lock_time()
            .await?
            .ok_or(LockError::NoActiveLock)?;

        Ok(Utc::now() - lock_time)
    }
}
