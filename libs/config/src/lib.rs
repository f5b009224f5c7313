use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

pub use wire::parse_duration;

/// default etcd endpoint when none is configured
pub static DEFAULT_ENDPOINT: &str = "127.0.0.1:2379";
/// time allowed to establish the connection
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
/// time allowed for each get/put
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
/// ttl of the lease backing the session, matches the etcd concurrency default
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60);

/// etcd user credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// coordination client config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationConfig {
    endpoints: Vec<String>,
    dial_timeout: Duration,
    request_timeout: Duration,
    session_ttl: Duration,
    /// `None` waits for the lock forever
    lock_timeout: Option<Duration>,
    credentials: Option<Credentials>,
    path: Option<PathBuf>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_owned()],
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            session_ttl: DEFAULT_SESSION_TTL,
            lock_timeout: None,
            credentials: None,
            path: None,
        }
    }
}

impl TryFrom<wire::Config> for CoordinationConfig {
    type Error = anyhow::Error;
    fn try_from(cfg: wire::Config) -> Result<Self> {
        let defaults = Self::default();
        let endpoints = match cfg.endpoints {
            Some(endpoints) => endpoints.into_vec(),
            None => defaults.endpoints,
        };
        let config = Self {
            endpoints,
            dial_timeout: cfg.dial_timeout.unwrap_or(defaults.dial_timeout),
            request_timeout: cfg.request_timeout.unwrap_or(defaults.request_timeout),
            session_ttl: cfg.session_ttl.unwrap_or(defaults.session_ttl),
            lock_timeout: cfg.lock_timeout,
            credentials: cfg.auth.map(|auth| Credentials {
                username: auth.username,
                password: auth.password,
            }),
            path: None,
        };
        config.validate()?;
        Ok(config)
    }
}

impl CoordinationConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut config = Self::parse_str(input)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let wire: wire::Config = match serde_json::from_str(s) {
            Ok(cfg) => cfg,
            Err(err) => {
                debug!(?err, "failed parsing config as json, trying yaml");
                serde_yaml::from_str(s).context("config is neither valid JSON nor YAML")?
            }
        };
        let config = Self::try_from(wire)?;
        debug!(?config);
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            bail!("at least one etcd endpoint is required");
        }
        if let Some(bad) = self.endpoints.iter().find(|e| e.trim().is_empty()) {
            bail!("invalid empty etcd endpoint {bad:?}");
        }
        if self.session_ttl < Duration::from_secs(1) {
            bail!(
                "session_ttl must be at least 1s, got {:?}",
                self.session_ttl
            );
        }
        if self.dial_timeout.is_zero() || self.request_timeout.is_zero() {
            bail!("dial_timeout and request_timeout must be non-zero");
        }
        Ok(())
    }

    /// replace the configured endpoints, e.g. from a cli override
    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout
    }
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
