//! Coordination client: typed configuration reads/writes and named
//! distributed locks over one connection and one lease-backed session.
//!
//! Two families of accessors are offered:
//! - `Result`-returning ones ([`get`](CoordinationClient::get),
//!   [`get_i64`](CoordinationClient::get_i64), [`put_int64`](CoordinationClient::put_int64),
//!   [`lock`](CoordinationClient::lock), ...) that keep the cause of a failure;
//! - legacy ones ([`get_string`](CoordinationClient::get_string),
//!   [`get_int`](CoordinationClient::get_int), [`set_int64`](CoordinationClient::set_int64),
//!   [`unlock`](CoordinationClient::unlock)) that collapse failures into a default
//!   value or a [`StatusCode`].

use std::fmt::Display;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use config::CoordinationConfig;

use crate::backend::{Backend, Connector, SessionId};
use crate::error::{CoordinationError, CoordinationResult};
use crate::etcd::EtcdConnector;
use crate::lock::LockGuard;
use crate::status::StatusCode;

/// Lifecycle of a [`CoordinationClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `init` has not succeeded yet.
    Uninitialized,
    /// Connected with a live session.
    Connected,
    /// `close` was called. `init` may be called again.
    Closed,
}

/// Inner state shared behind Arc<RwLock<…>>.
struct ClientInner {
    backend: Option<Arc<dyn Backend>>,
    session: Option<SessionId>,
    state: ConnectionState,
}

/// Client for configuration values and distributed locks.
///
/// Cheap to clone; clones share the connection and session. Create one per
/// logical lock owner: locks taken under the same session do not exclude
/// each other.
#[derive(Clone)]
pub struct CoordinationClient {
    inner: Arc<RwLock<ClientInner>>,
    /// serializes `init` without blocking readers of `inner`
    connecting: Arc<Mutex<()>>,
    connector: Arc<dyn Connector>,
    config: CoordinationConfig,
}

impl CoordinationClient {
    /// Create an etcd client from configuration, without connecting yet.
    ///
    /// Call [`init`](Self::init) or [`connect`](Self::connect) before use.
    pub fn new(config: CoordinationConfig) -> Self {
        Self::with_connector(config, EtcdConnector)
    }

    /// Create a client over a custom backend, e.g. a
    /// [`MemoryCluster`](crate::MemoryCluster).
    pub fn with_connector(config: CoordinationConfig, connector: impl Connector) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ClientInner {
                backend: None,
                session: None,
                state: ConnectionState::Uninitialized,
            })),
            connecting: Arc::default(),
            connector: Arc::new(connector),
            config,
        }
    }

    /// Returns the current lifecycle state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    /// Returns true if the client is connected.
    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    /// [`init`](Self::init) with the configured endpoints.
    pub async fn connect(&self) -> CoordinationResult<()> {
        let endpoints = self.config.endpoints().to_vec();
        self.init(&endpoints).await
    }

    /// Connect to `endpoints` and open the lease-backed session.
    ///
    /// Each step is bounded by the dial timeout. There is no retry. Calling
    /// `init` on a connected client is a no-op. A lease granted after session
    /// creation timed out is revoked in the background.
    pub async fn init<S: AsRef<str>>(&self, endpoints: &[S]) -> CoordinationResult<()> {
        let endpoints: Vec<String> = endpoints.iter().map(|e| e.as_ref().to_owned()).collect();
        if endpoints.is_empty() {
            return Err(CoordinationError::Config(
                "at least one endpoint is required".into(),
            ));
        }

        let _connecting = self.connecting.lock().await;
        if self.is_connected().await {
            debug!("coordination client already connected, skipping init");
            return Ok(());
        }

        let dial_timeout = self.config.dial_timeout();
        info!(?endpoints, ?dial_timeout, "connecting to coordination service");

        let backend = tokio::time::timeout(
            dial_timeout,
            self.connector.connect(&endpoints, &self.config),
        )
        .await
        .map_err(|_| {
            CoordinationError::Timeout(format!(
                "connecting to {endpoints:?} timed out after {dial_timeout:?}"
            ))
        })??;

        let ttl = self.config.session_ttl();
        let mut grant = tokio::spawn({
            let backend = Arc::clone(&backend);
            async move { backend.open_session(ttl).await }
        });
        let session = match tokio::time::timeout(dial_timeout, &mut grant).await {
            Ok(Ok(Ok(session))) => session,
            Ok(Ok(Err(err))) => {
                backend.close().await;
                return Err(CoordinationError::Session(err.to_string()));
            }
            Ok(Err(err)) => {
                backend.close().await;
                return Err(CoordinationError::Session(format!(
                    "session creation task failed: {err}"
                )));
            }
            Err(_) => {
                tokio::spawn(revoke_late_session(
                    grant,
                    backend,
                    self.config.request_timeout(),
                ));
                return Err(CoordinationError::Session(format!(
                    "session creation timed out after {dial_timeout:?}"
                )));
            }
        };

        let mut inner = self.inner.write().await;
        inner.backend = Some(backend);
        inner.session = Some(session);
        inner.state = ConnectionState::Connected;
        info!(session, ?ttl, "coordination client initialized");
        Ok(())
    }

    /// Revoke the session and drop the connection.
    ///
    /// Locks still held under the session are released by the service.
    /// Closing a client that is not connected does nothing.
    pub async fn close(&self) {
        let (backend, session) = {
            let mut inner = self.inner.write().await;
            if inner.state == ConnectionState::Connected {
                inner.state = ConnectionState::Closed;
            }
            (inner.backend.take(), inner.session.take())
        };
        let Some(backend) = backend else {
            return;
        };
        if let Some(session) = session {
            match tokio::time::timeout(
                self.config.request_timeout(),
                backend.revoke_session(session),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(session, error = %err, "failed to revoke session"),
                Err(_) => warn!(session, "revoking session timed out"),
            }
        }
        backend.close().await;
        info!("coordination client closed");
    }

    async fn backend(&self) -> CoordinationResult<Arc<dyn Backend>> {
        let inner = self.inner.read().await;
        match (&inner.backend, inner.state) {
            (Some(backend), ConnectionState::Connected) => Ok(Arc::clone(backend)),
            (_, ConnectionState::Closed) => Err(CoordinationError::NotConnected(
                "coordination client is closed".into(),
            )),
            _ => Err(CoordinationError::NotConnected(
                "coordination client not initialized, call init first".into(),
            )),
        }
    }

    async fn session(&self) -> CoordinationResult<(Arc<dyn Backend>, SessionId)> {
        let backend = self.backend().await?;
        let session = self.inner.read().await.session.ok_or_else(|| {
            CoordinationError::NotConnected("coordination client has no session".into())
        })?;
        Ok((backend, session))
    }

    /// run `fut` under the request timeout
    async fn timed<T, F>(&self, op: &str, key: &str, fut: F) -> CoordinationResult<T>
    where
        F: Future<Output = CoordinationResult<T>>,
    {
        let timeout = self.config.request_timeout();
        tokio::time::timeout(timeout, fut).await.map_err(|_| {
            CoordinationError::Timeout(format!("{op} '{key}' timed out after {timeout:?}"))
        })?
    }

    /// Read `key` as a string.
    ///
    /// When the response holds several entries the value of the **last** one
    /// is returned.
    pub async fn get(&self, key: &str) -> CoordinationResult<String> {
        let backend = self.backend().await?;
        let entries = self.timed("get", key, backend.get(key)).await?;
        entries
            .last()
            .map(|kv| kv.value_str().into_owned())
            .ok_or_else(|| CoordinationError::NotFound {
                key: key.to_owned(),
            })
    }

    /// Read `key` and parse it as `T`.
    pub async fn get_parsed<T>(&self, key: &str) -> CoordinationResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let value = self.get(key).await?;
        value
            .parse::<T>()
            .map_err(|e| CoordinationError::Coercion {
                key: key.to_owned(),
                reason: e.to_string(),
                value,
            })
    }

    pub async fn get_i32(&self, key: &str) -> CoordinationResult<i32> {
        self.get_parsed(key).await
    }

    pub async fn get_i64(&self, key: &str) -> CoordinationResult<i64> {
        self.get_parsed(key).await
    }

    /// Store `value` under `key`.
    pub async fn put(&self, key: &str, value: &str) -> CoordinationResult<()> {
        let backend = self.backend().await?;
        self.timed("put", key, backend.put(key, value)).await?;
        debug!(key, "value stored");
        Ok(())
    }

    /// Store `value` as its decimal string.
    pub async fn put_int64(&self, key: &str, value: i64) -> CoordinationResult<()> {
        self.put(key, &value.to_string()).await
    }

    /// Read `key`, or `default` on any failure.
    pub async fn get_string(&self, key: &str, default: &str) -> String {
        match self.get(key).await {
            Ok(value) => value,
            Err(err) => {
                debug!(key, error = %err, "read failed, falling back to default");
                default.to_owned()
            }
        }
    }

    /// Read `key` as an `i32`.
    ///
    /// Returns `default` when the read fails, and `0` when the read succeeds
    /// but the value is not an integer. Values outside the `i32` range also
    /// read as `0`; use [`get_int64`](Self::get_int64) for wider counters.
    pub async fn get_int(&self, key: &str, default: i32) -> i32 {
        legacy_value(key, default, self.get_i32(key).await)
    }

    /// Read `key` as an `i64`, with the same fallbacks as [`get_int`](Self::get_int).
    pub async fn get_int64(&self, key: &str, default: i64) -> i64 {
        legacy_value(key, default, self.get_i64(key).await)
    }

    /// Store `value` under `key`, reporting only success or failure.
    pub async fn set_int64(&self, key: &str, value: i64) -> StatusCode {
        let result = self.put_int64(key, value).await;
        if let Err(err) = &result {
            warn!(key, value, error = %err, "failed to store value");
        }
        StatusCode::from(&result)
    }

    /// Acquire the distributed lock `name` under this client's session.
    ///
    /// Waits until the lock is free. Without a configured `lock_timeout` the
    /// wait is unbounded, so a stalled coordination service blocks the caller
    /// indefinitely.
    pub async fn lock(&self, name: &str) -> CoordinationResult<LockGuard> {
        let (backend, session) = self.session().await?;
        debug!(name, session, "acquiring lock");

        let acquire = backend.lock(name, session);
        let acquired = match self.config.lock_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, acquire).await.map_err(|_| {
                CoordinationError::Timeout(format!(
                    "lock '{name}' not acquired within {timeout:?}"
                ))
            })?,
            None => acquire.await,
        };
        let key = acquired.map_err(|e| CoordinationError::LockAcquire {
            name: name.to_owned(),
            reason: e.to_string(),
        })?;

        info!(name, session, "lock acquired");
        Ok(LockGuard::new(name, key, backend))
    }

    /// Release a lock taken with [`lock`](Self::lock).
    pub async fn unlock(&self, guard: LockGuard) -> StatusCode {
        let name = guard.name().to_owned();
        let result = guard.release().await;
        if let Err(err) = &result {
            warn!(name = %name, error = %err, "failed to release lock");
        }
        StatusCode::from(&result)
    }

    /// Run `f` while holding the lock `name`, releasing it afterwards.
    ///
    /// Only acquisition errors are returned. A failed release is logged and
    /// the output of `f` is still returned; the lock is then freed when the
    /// session ends.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, f: F) -> CoordinationResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock(name).await?;
        let out = f().await;
        if let Err(err) = guard.release().await {
            warn!(name, error = %err, "failed to release lock");
        }
        Ok(out)
    }
}

/// wait out a lease grant that `init` stopped waiting for, then revoke it so
/// it does not linger until its ttl expires
async fn revoke_late_session(
    grant: JoinHandle<CoordinationResult<SessionId>>,
    backend: Arc<dyn Backend>,
    request_timeout: Duration,
) {
    if let Ok(Ok(session)) = grant.await {
        match tokio::time::timeout(request_timeout, backend.revoke_session(session)).await {
            Ok(Ok(())) => debug!(session, "revoked session granted after init gave up"),
            Ok(Err(err)) => warn!(session, error = %err, "failed to revoke late session"),
            Err(_) => warn!(session, "revoking late session timed out"),
        }
    }
    backend.close().await;
}

fn legacy_value<T: Default>(key: &str, default: T, result: CoordinationResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err @ CoordinationError::Coercion { .. }) => {
            warn!(key, error = %err, "value is not an integer, using zero");
            T::default()
        }
        Err(err) => {
            debug!(key, error = %err, "read failed, falling back to default");
            default
        }
    }
}

impl std::fmt::Debug for CoordinationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("connector", &self.connector)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tracing_test::traced_test;

    use super::*;
    use crate::memory::{Fault, MemoryCluster};

    const ENDPOINTS: &[&str] = &["memory:2379"];

    fn client(cluster: &MemoryCluster) -> CoordinationClient {
        CoordinationClient::with_connector(CoordinationConfig::default(), cluster.clone())
    }

    async fn connected(cluster: &MemoryCluster) -> CoordinationClient {
        let client = client(cluster);
        client.init(ENDPOINTS).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = client(&MemoryCluster::new());
        assert_eq!(
            client.connection_state().await,
            ConnectionState::Uninitialized
        );
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_ops_before_init_fail() {
        let client = client(&MemoryCluster::new());
        assert!(matches!(
            client.get("cfg/x").await,
            Err(CoordinationError::NotConnected(_))
        ));
        assert!(matches!(
            client.put_int64("cfg/x", 1).await,
            Err(CoordinationError::NotConnected(_))
        ));
        assert!(matches!(
            client.lock("jobs").await,
            Err(CoordinationError::NotConnected(_))
        ));
        assert_eq!(client.set_int64("cfg/x", 1).await, StatusCode::Err);
        assert_eq!(client.get_int64("cfg/x", -1).await, -1);
        assert_eq!(client.get_string("cfg/x", "dflt").await, "dflt");
    }

    #[tokio::test]
    async fn test_init_requires_endpoints() {
        let client = client(&MemoryCluster::new());
        let none: &[&str] = &[];
        assert!(matches!(
            client.init(none).await,
            Err(CoordinationError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_init_connect_failure() {
        let cluster = MemoryCluster::new();
        cluster.set_fault(Fault::Unavailable);
        let client = client(&cluster);
        assert!(matches!(
            client.init(ENDPOINTS).await,
            Err(CoordinationError::Transport(_))
        ));
        assert_eq!(
            client.connection_state().await,
            ConnectionState::Uninitialized
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_dial_timeout() {
        let cluster = MemoryCluster::new();
        cluster.set_fault(Fault::Stalled);
        let client = client(&cluster);
        let err = client.init(ENDPOINTS).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_init_session_failure() {
        let cluster = MemoryCluster::new();
        cluster.reject_sessions(true);
        let client = client(&cluster);
        assert!(matches!(
            client.init(ENDPOINTS).await,
            Err(CoordinationError::Session(_))
        ));
        assert!(!client.is_connected().await);
        assert_eq!(cluster.session_count(), 0);
    }

    #[tokio::test]
    async fn test_init_twice_keeps_session() {
        let cluster = MemoryCluster::new();
        let client = connected(&cluster).await;
        client.init(ENDPOINTS).await.unwrap();
        assert_eq!(cluster.session_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_uses_config_endpoints() {
        let cluster = MemoryCluster::new();
        let client = CoordinationClient::with_connector(
            CoordinationConfig::default().with_endpoints(["memory:1", "memory:2"]),
            cluster,
        );
        client.connect().await.unwrap();
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_absent_key_returns_default() {
        let client = connected(&MemoryCluster::new()).await;
        assert_eq!(client.get_string("cfg/missing", "dflt").await, "dflt");
        assert_eq!(client.get_int("cfg/missing", 7).await, 7);
        assert_eq!(client.get_int64("cfg/missing", -1).await, -1);

        let err = client.get("cfg/missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_last_entry_wins() {
        let cluster = MemoryCluster::new();
        cluster.insert_entries("cfg/multi", ["first", "second", "third"]);
        let client = connected(&cluster).await;
        assert_eq!(client.get_string("cfg/multi", "dflt").await, "third");
        assert_eq!(client.get("cfg/multi").await.unwrap(), "third");

        cluster.insert_entries("cfg/multi-int", ["1", "2"]);
        assert_eq!(client.get_int64("cfg/multi-int", -1).await, 2);
    }

    #[tokio::test]
    async fn test_unparsable_value_yields_zero() {
        let cluster = MemoryCluster::new();
        cluster.insert_entries("cfg/bad", ["forty-two"]);
        let client = connected(&cluster).await;
        assert_eq!(client.get_int("cfg/bad", 7).await, 0);
        assert_eq!(client.get_int64("cfg/bad", -1).await, 0);
        // the string accessor still sees the raw value
        assert_eq!(client.get_string("cfg/bad", "dflt").await, "forty-two");

        let err = client.get_i64("cfg/bad").await.unwrap_err();
        assert!(err.is_coercion());
        match err {
            CoordinationError::Coercion { key, value, .. } => {
                assert_eq!(key, "cfg/bad");
                assert_eq!(value, "forty-two");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_int_overflow_is_coercion() {
        let cluster = MemoryCluster::new();
        let client = connected(&cluster).await;
        client.put_int64("cfg/big", i64::MAX).await.unwrap();
        assert_eq!(client.get_int("cfg/big", 7).await, 0);
        assert_eq!(client.get_int64("cfg/big", 7).await, i64::MAX);
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let cluster = MemoryCluster::new();
        let client = connected(&cluster).await;
        for value in [0, 42, -17, i64::MIN] {
            assert_eq!(client.set_int64("cfg/rt", value).await, StatusCode::Ok);
            assert_eq!(client.get_int64("cfg/rt", 1).await, value);
        }
        assert_eq!(cluster.value("cfg/rt").as_deref(), Some("-9223372036854775808"));
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let client = client(&MemoryCluster::new());
        client.init(&["endpoint:port"]).await.unwrap();
        assert_eq!(client.set_int64("cfg/x", 42).await, StatusCode::Ok);
        assert_eq!(client.get_int64("cfg/x", -1).await, 42);
        assert_eq!(client.get_int64("cfg/missing", -1).await, -1);
        client.close().await;
        assert_eq!(client.connection_state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreachable_falls_back_to_default() {
        let cluster = MemoryCluster::new();
        let client = connected(&cluster).await;
        client.put("cfg/name", "dora").await.unwrap();

        cluster.set_fault(Fault::Unavailable);
        assert_eq!(client.get_string("cfg/name", "dflt").await, "dflt");
        assert_eq!(client.get_int64("cfg/n", 5).await, 5);
        assert_eq!(client.set_int64("cfg/n", 1).await, StatusCode::Err);
        assert!(client.get("cfg/name").await.unwrap_err().is_retryable());
        assert!(logs_contain("falling back to default"));
        assert!(logs_contain("failed to store value"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let cluster = MemoryCluster::new();
        let client = connected(&cluster).await;
        cluster.set_fault(Fault::Stalled);

        let err = client.get("cfg/x").await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.get_int64("cfg/x", -1).await, -1);
        assert_eq!(client.set_int64("cfg/x", 1).await, StatusCode::Err);
    }

    #[tokio::test]
    async fn test_close_ends_client() {
        let cluster = MemoryCluster::new();
        let client = connected(&cluster).await;
        assert_eq!(cluster.session_count(), 1);

        client.close().await;
        assert_eq!(cluster.session_count(), 0);
        assert!(matches!(
            client.get("cfg/x").await,
            Err(CoordinationError::NotConnected(_))
        ));
        // closing twice is harmless
        client.close().await;

        // a closed client can be initialized again
        client.init(ENDPOINTS).await.unwrap();
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_close_uninitialized() {
        let client = client(&MemoryCluster::new());
        client.close().await;
        assert_eq!(
            client.connection_state().await,
            ConnectionState::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_lock_unlock() {
        let cluster = MemoryCluster::new();
        let client = connected(&cluster).await;
        let guard = client.lock("jobs").await.unwrap();
        assert_eq!(guard.name(), "jobs");
        assert!(guard.key().starts_with(b"jobs/"));
        assert!(cluster.is_locked("jobs"));

        assert_eq!(client.unlock(guard).await, StatusCode::Ok);
        assert!(!cluster.is_locked("jobs"));
    }

    #[tokio::test]
    async fn test_lock_serializes_owners() {
        let cluster = MemoryCluster::new();
        let first = connected(&cluster).await;
        let second = connected(&cluster).await;
        let events = Arc::new(Mutex::new(Vec::new()));

        let guard = first.lock("critical").await.unwrap();
        events.lock().unwrap().push("first enter");

        let waiter = {
            let events = Arc::clone(&events);
            tokio::spawn(async move {
                let guard = second.lock("critical").await.unwrap();
                events.lock().unwrap().push("second enter");
                second.unlock(guard).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        events.lock().unwrap().push("first exit");
        assert_eq!(first.unlock(guard).await, StatusCode::Ok);

        assert_eq!(waiter.await.unwrap(), StatusCode::Ok);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["first enter", "first exit", "second enter"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_timeout() {
        let cluster = MemoryCluster::new();
        let holder = connected(&cluster).await;
        let contender = CoordinationClient::with_connector(
            CoordinationConfig::default().with_lock_timeout(Some(Duration::from_millis(200))),
            cluster.clone(),
        );
        contender.init(ENDPOINTS).await.unwrap();

        let guard = holder.lock("jobs").await.unwrap();
        let err = contender.lock("jobs").await.unwrap_err();
        assert!(err.is_timeout());

        holder.unlock(guard).await;
        let guard = contender.lock("jobs").await.unwrap();
        assert_eq!(contender.unlock(guard).await, StatusCode::Ok);
    }

    #[tokio::test]
    async fn test_lock_failure_is_reported() {
        let cluster = MemoryCluster::new();
        let client = connected(&cluster).await;
        cluster.set_fault(Fault::Unavailable);
        assert!(matches!(
            client.lock("jobs").await,
            Err(CoordinationError::LockAcquire { .. })
        ));
    }

    #[tokio::test]
    async fn test_unlock_failure_is_err() {
        let cluster = MemoryCluster::new();
        let client = connected(&cluster).await;
        let guard = client.lock("jobs").await.unwrap();
        cluster.set_fault(Fault::Unavailable);
        assert_eq!(client.unlock(guard).await, StatusCode::Err);
    }

    #[tokio::test]
    async fn test_close_releases_locks() {
        let cluster = MemoryCluster::new();
        let first = connected(&cluster).await;
        let second = connected(&cluster).await;

        let stale = first.lock("jobs").await.unwrap();
        first.close().await;
        assert!(!cluster.is_locked("jobs"));

        let guard = second.lock("jobs").await.unwrap();
        assert_eq!(second.unlock(guard).await, StatusCode::Ok);
        // releasing through the closed client's guard is a no-op
        assert!(stale.release().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let cluster = MemoryCluster::new();
        let first = connected(&cluster).await;
        let second = connected(&cluster).await;

        drop(first.lock("jobs").await.unwrap());
        let guard = tokio::time::timeout(Duration::from_secs(5), second.lock("jobs"))
            .await
            .expect("dropped guard was not released")
            .unwrap();
        assert_eq!(second.unlock(guard).await, StatusCode::Ok);
    }

    #[tokio::test]
    async fn test_with_lock() {
        let cluster = MemoryCluster::new();
        let client = connected(&cluster).await;
        let observed = {
            let cluster = cluster.clone();
            client
                .with_lock("jobs", || async move { cluster.is_locked("jobs") })
                .await
                .unwrap()
        };
        assert!(observed);
        assert!(!cluster.is_locked("jobs"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_with_lock_keeps_output_when_release_fails() {
        let cluster = MemoryCluster::new();
        let client = connected(&cluster).await;
        let out = {
            let cluster = cluster.clone();
            client
                .with_lock("jobs", || async move {
                    cluster.set_fault(Fault::Unavailable);
                    42
                })
                .await
        };
        assert_eq!(out.unwrap(), 42);
        assert!(logs_contain("failed to release lock"));

        // still held by the session until it ends
        cluster.set_fault(Fault::None);
        assert!(cluster.is_locked("jobs"));
        client.close().await;
        assert!(!cluster.is_locked("jobs"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_session_timeout_revokes_late_lease() {
        let cluster = MemoryCluster::new();
        cluster.hold_sessions(true);
        let client = client(&cluster);

        let err = client.init(ENDPOINTS).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Session(_)));
        assert!(!client.is_connected().await);

        // the grant lands after init gave up and is revoked straight away
        cluster.hold_sessions(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cluster.session_count(), 0);

        client.init(ENDPOINTS).await.unwrap();
        assert_eq!(cluster.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_readable_during_init() {
        let cluster = MemoryCluster::new();
        cluster.hold_sessions(true);
        let client = client(&cluster);

        let init = {
            let client = client.clone();
            tokio::spawn(async move { client.init(ENDPOINTS).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!init.is_finished());

        let state = tokio::time::timeout(Duration::from_millis(100), client.connection_state())
            .await
            .expect("state blocked by pending init");
        assert_eq!(state, ConnectionState::Uninitialized);
        assert!(matches!(
            client.get("cfg/x").await,
            Err(CoordinationError::NotConnected(_))
        ));

        cluster.hold_sessions(false);
        init.await.unwrap().unwrap();
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_init_with_credentials() {
        let cluster = MemoryCluster::new();
        let root = config::Credentials {
            username: "root".into(),
            password: "hunter2".into(),
        };
        cluster.require_credentials(Some(root.clone()));

        let anonymous = client(&cluster);
        assert!(matches!(
            anonymous.init(ENDPOINTS).await,
            Err(CoordinationError::Transport(_))
        ));

        let authed = CoordinationClient::with_connector(
            CoordinationConfig::default().with_credentials(Some(root)),
            cluster.clone(),
        );
        authed.init(ENDPOINTS).await.unwrap();
        assert!(authed.is_connected().await);
    }
}
