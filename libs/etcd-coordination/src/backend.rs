//! Abstract coordination backend interface.
//!
//! [`Connector`] establishes a connection and [`Backend`] is the connection
//! itself. `CoordinationClient` applies timeouts, state checks and value
//! coercion on top, so implementations only move bytes. The etcd
//! implementation lives in [`crate::etcd`], an in-process one in
//! [`crate::memory`].

use std::{borrow::Cow, fmt, sync::Arc};

use async_trait::async_trait;
use config::CoordinationConfig;

use crate::error::CoordinationResult;

/// Id of a lease-backed session.
pub type SessionId = i64;

/// One entry of a get response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    key: Vec<u8>,
    value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// value as text, invalid UTF-8 is replaced
    pub fn value_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// Creates connected backends.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    /// Connect to `endpoints`. The caller bounds this with the dial timeout.
    async fn connect(
        &self,
        endpoints: &[String],
        config: &CoordinationConfig,
    ) -> CoordinationResult<Arc<dyn Backend>>;
}

/// A live connection to the coordination service.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug + 'static {
    /// All entries stored under `key`, in response order.
    async fn get(&self, key: &str) -> CoordinationResult<Vec<KeyValue>>;

    /// Store `value` under `key`.
    async fn put(&self, key: &str, value: &str) -> CoordinationResult<()>;

    /// Grant a lease with the given ttl and keep it alive until revoked.
    async fn open_session(&self, ttl: std::time::Duration) -> CoordinationResult<SessionId>;

    /// Revoke the lease, releasing every lock held under it.
    async fn revoke_session(&self, session: SessionId) -> CoordinationResult<()>;

    /// Block until the mutex `name` is held by `session`. Returns the
    /// ownership key needed to unlock.
    async fn lock(&self, name: &str, session: SessionId) -> CoordinationResult<Vec<u8>>;

    /// Release the mutex identified by its ownership key.
    async fn unlock(&self, key: &[u8]) -> CoordinationResult<()>;

    /// Tear down the connection.
    async fn close(&self);
}
