//! Scoped ownership of an execution lock

use super::traits::{ExecutionLock, LockError, LockToken};
use std::sync::Arc;
use std::time::Duration;

/// A held execution lock for one processing pass
///
/// Call [`Lease::release`] on every exit path. A lease dropped while still
/// held, e.g. because the pass future was aborted, releases itself on the
/// current Tokio runtime; the lock's expiration covers a crashed process.
pub struct Lease {
    lock: Arc<dyn ExecutionLock>,
    token: Option<LockToken>,
}

impl Lease {
    pub async fn acquire(
        lock: Arc<dyn ExecutionLock>,
        key: &str,
        expiration: Duration,
        wait: Duration,
    ) -> Result<Self, LockError> {
        let token = lock.acquire(key, expiration, wait).await?;
        tracing::debug!(key, "Execution lock acquired");
        Ok(Self {
            lock,
            token: Some(token),
        })
    }

    pub fn key(&self) -> Option<&str> {
        self.token.as_ref().map(|token| token.key.as_str())
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        let Some(token) = self.token.clone() else {
            return Ok(());
        };
        let result = self.lock.release(&token).await;
        // Disarmed only after the attempt; a release interrupted mid-flight
        // falls back to the drop path
        self.token = None;
        match &result {
            Ok(()) => tracing::debug!(key = %token.key, "Execution lock released"),
            Err(e) => {
                tracing::warn!(key = %token.key, error = %e, "Failed to release execution lock");
            }
        }
        result
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let lock = self.lock.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(key = %token.key, "Releasing dropped execution lock");
                handle.spawn(async move {
                    if let Err(e) = lock.release(&token).await {
                        tracing::warn!(
                            key = %token.key,
                            error = %e,
                            "Failed to release dropped execution lock"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    key = %token.key,
                    "No runtime to release dropped execution lock; it will expire"
                );
            }
        }
    }
}
