//! Per-session state lock.
//!
//! Serializes every mutation source — inbound handlers, the heartbeat,
//! adapter callbacks, scheduled decay fires — onto one FIFO async mutex.
//! Acquisition carries a 5 s timeout and a named operation for logging;
//! contention beyond 100 ms is warned about. The try variant backs
//! best-effort low-priority work (heartbeat broadcast while a handler is
//! in flight).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard};

use pg_domain::error::{Error, Result};

pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const CONTENTION_WARN: Duration = Duration::from_millis(100);

/// A named, timeout-guarded async mutex around a session's runtime.
pub struct StateLock<T> {
    session_id: String,
    inner: Arc<Mutex<T>>,
}

impl<T: Send + 'static> StateLock<T> {
    pub fn new(session_id: impl Into<String>, value: T) -> Self {
        Self {
            session_id: session_id.into(),
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Acquire for `operation`. Errors out (without corrupting anything)
    /// if the lock cannot be had within the timeout.
    pub async fn acquire(&self, operation: &str) -> Result<OwnedMutexGuard<T>> {
        let started = Instant::now();
        let guard = tokio::time::timeout(ACQUIRE_TIMEOUT, self.inner.clone().lock_owned())
            .await
            .map_err(|_| Error::LockTimeout {
                operation: operation.to_string(),
            })?;

        let waited = started.elapsed();
        if waited > CONTENTION_WARN {
            tracing::warn!(
                session_id = %self.session_id,
                operation,
                waited_ms = waited.as_millis() as u64,
                "state lock contention"
            );
        }
        Ok(guard)
    }

    /// Non-blocking acquire; `None` when another operation holds the
    /// lock.
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<T>> {
        self.inner.clone().try_lock_owned().ok()
    }
}

impl<T> Clone for StateLock<T> {
    fn clone(&self) -> Self {
        Self {
            session_id: self.session_id.clone(),
            inner: self.inner.clone(),
        }
    }
}
