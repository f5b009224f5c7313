//! Caller-owned handles for held distributed locks.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::backend::Backend;
use crate::error::{CoordinationError, CoordinationResult};

/// A held distributed lock.
///
/// Returned by [`CoordinationClient::lock`](crate::CoordinationClient::lock).
/// Release it with [`release`](Self::release) (or
/// [`CoordinationClient::unlock`](crate::CoordinationClient::unlock)). A guard
/// dropped without being released unlocks in the background on the current
/// tokio runtime; outside a runtime the lock stays held until its session
/// expires.
#[derive(Debug)]
#[must_use = "a lock is released when its guard is released or dropped"]
pub struct LockGuard {
    name: String,
    key: Vec<u8>,
    backend: Option<Arc<dyn Backend>>,
}

impl LockGuard {
    pub(crate) fn new(name: &str, key: Vec<u8>, backend: Arc<dyn Backend>) -> Self {
        Self {
            name: name.to_owned(),
            key,
            backend: Some(backend),
        }
    }

    /// name the lock was requested under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// ownership key assigned by the coordination service
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Release the lock.
    pub async fn release(mut self) -> CoordinationResult<()> {
        let Some(backend) = self.backend.take() else {
            return Ok(());
        };
        backend
            .unlock(&self.key)
            .await
            .map_err(|e| CoordinationError::LockRelease {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        debug!(name = %self.name, "lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        let key = std::mem::take(&mut self.key);
        match Handle::try_current() {
            Ok(handle) => {
                warn!(name = %name, "lock guard dropped without release, unlocking in background");
                handle.spawn(async move {
                    if let Err(err) = backend.unlock(&key).await {
                        error!(name = %name, error = %err, "background unlock failed");
                    }
                });
            }
            Err(_) => {
                error!(
                    name = %name,
                    "lock guard dropped outside a tokio runtime, lock held until its session expires"
                );
            }
        }
    }
}
