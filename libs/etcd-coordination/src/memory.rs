//! In-process coordination backend.
//!
//! Several clients connected to the same [`MemoryCluster`] share its store,
//! sessions and mutexes, so lock contention behaves like it does against a
//! real cluster. Faults can be injected to exercise the failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use config::{CoordinationConfig, Credentials};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tracing::debug;

use crate::backend::{Backend, Connector, KeyValue, SessionId};
use crate::error::{CoordinationError, CoordinationResult};

/// Failure mode applied to every operation of a [`MemoryCluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    /// Operate normally.
    #[default]
    None,
    /// Fail immediately with a transport error.
    Unavailable,
    /// Never respond.
    Stalled,
}

#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<Mutex<ClusterState>>,
    /// lease grants wait while this is `true`
    hold_sessions: Arc<watch::Sender<bool>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        let (hold_sessions, _) = watch::channel(false);
        Self {
            inner: Arc::default(),
            hold_sessions: Arc::new(hold_sessions),
        }
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    kv: HashMap<String, Vec<KeyValue>>,
    mutexes: HashMap<String, Arc<AsyncMutex<()>>>,
    held: HashMap<Vec<u8>, HeldLock>,
    sessions: HashSet<SessionId>,
    last_session: SessionId,
    fault: Fault,
    reject_sessions: bool,
    required_user: Option<Credentials>,
}

#[derive(Debug)]
struct HeldLock {
    session: SessionId,
    _guard: OwnedMutexGuard<()>,
}

/// ownership key, same layout etcd uses: `<name>/<lease id in hex>`
fn owner_key(name: &str, session: SessionId) -> Vec<u8> {
    format!("{name}/{session:x}").into_bytes()
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.inner.lock().expect("memory cluster lock poisoned")
    }

    pub fn set_fault(&self, fault: Fault) {
        self.state().fault = fault;
    }

    /// make lease grants fail while the cluster is otherwise reachable
    pub fn reject_sessions(&self, reject: bool) {
        self.state().reject_sessions = reject;
    }

    /// park lease grants until called again with `false`, leaving the rest
    /// of the cluster responsive
    pub fn hold_sessions(&self, hold: bool) {
        self.hold_sessions.send_replace(hold);
    }

    /// refuse connections that do not present `credentials`
    pub fn require_credentials(&self, credentials: Option<Credentials>) {
        self.state().required_user = credentials;
    }

    /// seed `key` with several entries, as returned by one multi-entry response
    pub fn insert_entries<I, S>(&self, key: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        let entries = values
            .into_iter()
            .map(|value| KeyValue::new(key, value))
            .collect();
        self.state().kv.insert(key.to_owned(), entries);
    }

    /// the last stored value of `key`
    pub fn value(&self, key: &str) -> Option<String> {
        self.state()
            .kv
            .get(key)
            .and_then(|entries| entries.last())
            .map(|kv| kv.value_str().into_owned())
    }

    pub fn is_locked(&self, name: &str) -> bool {
        let prefix = format!("{name}/");
        self.state()
            .held
            .keys()
            .any(|key| key.starts_with(prefix.as_bytes()))
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    async fn check_fault(&self) -> CoordinationResult<()> {
        let fault = self.state().fault;
        match fault {
            Fault::None => Ok(()),
            Fault::Unavailable => Err(CoordinationError::Transport(
                "memory cluster unavailable".into(),
            )),
            Fault::Stalled => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    async fn connect(
        &self,
        endpoints: &[String],
        config: &CoordinationConfig,
    ) -> CoordinationResult<Arc<dyn Backend>> {
        self.check_fault().await?;
        if let Some(required) = &self.state().required_user {
            if config.credentials() != Some(required) {
                return Err(CoordinationError::Transport(
                    "authentication failed: invalid user ID or password".into(),
                ));
            }
        }
        debug!(?endpoints, "connected to memory cluster");
        Ok(Arc::new(MemoryBackend {
            cluster: self.clone(),
        }))
    }
}

/// Connection to a [`MemoryCluster`].
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    cluster: MemoryCluster,
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> CoordinationResult<Vec<KeyValue>> {
        self.cluster.check_fault().await?;
        Ok(self.cluster.state().kv.get(key).cloned().unwrap_or_default())
    }

    async fn put(&self, key: &str, value: &str) -> CoordinationResult<()> {
        self.cluster.check_fault().await?;
        self.cluster
            .state()
            .kv
            .insert(key.to_owned(), vec![KeyValue::new(key, value)]);
        Ok(())
    }

    async fn open_session(&self, ttl: Duration) -> CoordinationResult<SessionId> {
        self.cluster.check_fault().await?;
        let mut hold = self.cluster.hold_sessions.subscribe();
        if hold.wait_for(|held| !*held).await.is_err() {
            return Err(CoordinationError::Transport("memory cluster dropped".into()));
        }
        let mut state = self.cluster.state();
        if state.reject_sessions {
            return Err(CoordinationError::Transport(
                "lease grant rejected by memory cluster".into(),
            ));
        }
        state.last_session += 1;
        let session = state.last_session;
        state.sessions.insert(session);
        debug!(session, ?ttl, "granted memory session");
        Ok(session)
    }

    async fn revoke_session(&self, session: SessionId) -> CoordinationResult<()> {
        self.cluster.check_fault().await?;
        let mut state = self.cluster.state();
        state.sessions.remove(&session);
        // dropping the guards hands the mutexes to the next waiter
        state.held.retain(|_, held| held.session != session);
        Ok(())
    }

    async fn lock(&self, name: &str, session: SessionId) -> CoordinationResult<Vec<u8>> {
        self.cluster.check_fault().await?;
        let key = owner_key(name, session);
        let mutex = {
            let mut state = self.cluster.state();
            if !state.sessions.contains(&session) {
                return Err(CoordinationError::Transport(format!(
                    "session {session:x} not found"
                )));
            }
            // etcd treats a second acquire under the same lease as already held
            if state.held.contains_key(&key) {
                return Ok(key);
            }
            Arc::clone(state.mutexes.entry(name.to_owned()).or_default())
        };

        let guard = mutex.lock_owned().await;

        let mut state = self.cluster.state();
        if !state.sessions.contains(&session) {
            return Err(CoordinationError::Transport(format!(
                "session {session:x} revoked while waiting for lock '{name}'"
            )));
        }
        state.held.insert(
            key.clone(),
            HeldLock {
                session,
                _guard: guard,
            },
        );
        Ok(key)
    }

    async fn unlock(&self, key: &[u8]) -> CoordinationResult<()> {
        self.cluster.check_fault().await?;
        // unknown keys are a no-op, like deleting a missing key in etcd
        self.cluster.state().held.remove(key);
        Ok(())
    }

    async fn close(&self) {
        debug!("memory backend closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend(cluster: &MemoryCluster) -> Arc<dyn Backend> {
        cluster
            .connect(&["memory".to_string()], &CoordinationConfig::default())
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn put_replaces_entries() {
        let cluster = MemoryCluster::new();
        cluster.insert_entries("k", ["a", "b"]);
        let backend = backend(&cluster).await;
        assert_eq!(backend.get("k").await.unwrap().len(), 2);

        backend.put("k", "c").await.unwrap();
        let entries = backend.get("k").await.unwrap();
        assert_eq!(entries, vec![KeyValue::new("k", "c")]);
        assert!(backend.get("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_key_layout() {
        let cluster = MemoryCluster::new();
        let backend = backend(&cluster).await;
        let session = backend.open_session(Duration::from_secs(60)).await.unwrap();
        let key = backend.lock("jobs", session).await.unwrap();
        assert_eq!(key, format!("jobs/{session:x}").into_bytes());
        assert!(cluster.is_locked("jobs"));
        assert!(!cluster.is_locked("job"));

        backend.unlock(&key).await.unwrap();
        assert!(!cluster.is_locked("jobs"));
        // second unlock is a no-op
        backend.unlock(&key).await.unwrap();
    }

    #[tokio::test]
    async fn revoke_releases_locks() {
        let cluster = MemoryCluster::new();
        let backend = backend(&cluster).await;
        let first = backend.open_session(Duration::from_secs(60)).await.unwrap();
        let second = backend.open_session(Duration::from_secs(60)).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(cluster.session_count(), 2);

        backend.lock("jobs", first).await.unwrap();
        let waiter = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.lock("jobs", second).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        backend.revoke_session(first).await.unwrap();
        let key = waiter.await.unwrap().unwrap();
        assert_eq!(key, owner_key("jobs", second));
        assert_eq!(cluster.session_count(), 1);
    }

    #[tokio::test]
    async fn lock_requires_live_session() {
        let cluster = MemoryCluster::new();
        let backend = backend(&cluster).await;
        assert!(backend.lock("jobs", 42).await.is_err());
    }

    #[tokio::test]
    async fn faults() {
        let cluster = MemoryCluster::new();
        let backend = backend(&cluster).await;

        cluster.set_fault(Fault::Unavailable);
        assert!(matches!(
            backend.get("k").await,
            Err(CoordinationError::Transport(_))
        ));
        assert!(backend.put("k", "v").await.is_err());
        assert!(
            cluster
                .connect(&[], &CoordinationConfig::default())
                .await
                .is_err()
        );

        cluster.set_fault(Fault::None);
        cluster.reject_sessions(true);
        assert!(backend.open_session(Duration::from_secs(1)).await.is_err());
        assert!(backend.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn held_sessions_wait() {
        let cluster = MemoryCluster::new();
        let backend = backend(&cluster).await;
        cluster.hold_sessions(true);

        let grant = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.open_session(Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        assert!(!grant.is_finished());
        assert_eq!(cluster.session_count(), 0);
        // other operations are unaffected
        backend.put("k", "v").await.unwrap();

        cluster.hold_sessions(false);
        grant.await.unwrap().unwrap();
        assert_eq!(cluster.session_count(), 1);
    }

    #[tokio::test]
    async fn required_credentials() {
        let cluster = MemoryCluster::new();
        let root = Credentials {
            username: "root".into(),
            password: "hunter2".into(),
        };
        cluster.require_credentials(Some(root.clone()));

        let anonymous = CoordinationConfig::default();
        assert!(cluster.connect(&[], &anonymous).await.is_err());
        let wrong = anonymous.clone().with_credentials(Some(Credentials {
            password: "guess".into(),
            ..root.clone()
        }));
        assert!(cluster.connect(&[], &wrong).await.is_err());
        let authed = anonymous.with_credentials(Some(root));
        assert!(cluster.connect(&[], &authed).await.is_ok());
    }
}
