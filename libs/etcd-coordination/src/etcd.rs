//! etcd v3 backend built on `etcd-client`.
//!
//! A session is an etcd lease kept alive by a background task; locks are
//! taken through the v3 lock service with that lease attached, so they are
//! released by etcd itself once the lease expires or is revoked.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, LockOptions};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use config::CoordinationConfig;

use crate::backend::{Backend, Connector, KeyValue, SessionId};
use crate::error::{CoordinationError, CoordinationResult};

/// Keep-alive requests are never sent more often than this.
const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Connects to an etcd cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct EtcdConnector;

#[async_trait]
impl Connector for EtcdConnector {
    async fn connect(
        &self,
        endpoints: &[String],
        config: &CoordinationConfig,
    ) -> CoordinationResult<Arc<dyn Backend>> {
        let mut options = ConnectOptions::new().with_connect_timeout(config.dial_timeout());
        if let Some(credentials) = config.credentials() {
            options = options.with_user(
                credentials.username.clone(),
                credentials.password.clone(),
            );
        }

        let mut client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| {
                CoordinationError::Transport(format!(
                    "failed to connect to etcd at {endpoints:?}: {e}"
                ))
            })?;
        // channels are lazy, make sure a member actually answers
        client.status().await.map_err(|e| {
            CoordinationError::Transport(format!("etcd at {endpoints:?} unreachable: {e}"))
        })?;
        info!(?endpoints, "etcd connection established");
        Ok(Arc::new(EtcdBackend::new(client)))
    }
}

/// A connected etcd client plus the keep-alive task of its session.
pub struct EtcdBackend {
    client: Client,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdBackend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            keep_alive: Mutex::new(None),
        }
    }

    fn stop_keep_alive(&self) {
        let task = self
            .keep_alive
            .lock()
            .expect("keep-alive lock poisoned")
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

fn transport(op: &str, err: etcd_client::Error) -> CoordinationError {
    CoordinationError::Transport(format!("etcd {op} failed: {err}"))
}

#[async_trait]
impl Backend for EtcdBackend {
    async fn get(&self, key: &str) -> CoordinationResult<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(|e| transport("get", e))?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KeyValue::new(kv.key(), kv.value()))
            .collect())
    }

    async fn put(&self, key: &str, value: &str) -> CoordinationResult<()> {
        let mut client = self.client.clone();
        client
            .put(key, value, None)
            .await
            .map_err(|e| transport("put", e))?;
        Ok(())
    }

    async fn open_session(&self, ttl: Duration) -> CoordinationResult<SessionId> {
        let mut client = self.client.clone();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);
        let lease = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(|e| transport("lease grant", e))?;
        let id = lease.id();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(id)
            .await
            .map_err(|e| transport("lease keep-alive", e))?;

        let interval = (ttl / 3).max(MIN_KEEP_ALIVE_INTERVAL);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = keeper.keep_alive().await {
                    warn!(lease = id, error = %err, "lease keep-alive request failed");
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        trace!(lease = id, ttl = resp.ttl(), "lease renewed");
                    }
                    Ok(_) => {
                        warn!(lease = id, "lease expired, session lost");
                        break;
                    }
                    Err(err) => {
                        warn!(lease = id, error = %err, "lease keep-alive stream failed");
                        break;
                    }
                }
            }
        });

        let previous = self
            .keep_alive
            .lock()
            .expect("keep-alive lock poisoned")
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }

        debug!(lease = id, ttl_secs, ?interval, "etcd session opened");
        Ok(id)
    }

    async fn revoke_session(&self, session: SessionId) -> CoordinationResult<()> {
        self.stop_keep_alive();
        let mut client = self.client.clone();
        client
            .lease_revoke(session)
            .await
            .map_err(|e| transport("lease revoke", e))?;
        debug!(lease = session, "etcd session revoked");
        Ok(())
    }

    async fn lock(&self, name: &str, session: SessionId) -> CoordinationResult<Vec<u8>> {
        let mut client = self.client.clone();
        let resp = client
            .lock(name, Some(LockOptions::new().with_lease(session)))
            .await
            .map_err(|e| transport("lock", e))?;
        Ok(resp.key().to_vec())
    }

    async fn unlock(&self, key: &[u8]) -> CoordinationResult<()> {
        let mut client = self.client.clone();
        client
            .unlock(key.to_vec())
            .await
            .map_err(|e| transport("unlock", e))?;
        Ok(())
    }

    async fn close(&self) {
        self.stop_keep_alive();
        debug!("etcd backend closed");
    }
}

impl Drop for EtcdBackend {
    fn drop(&mut self) {
        self.stop_keep_alive();
    }
}

impl std::fmt::Debug for EtcdBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdBackend").finish_non_exhaustive()
    }
}
