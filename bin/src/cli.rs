//! Parse from either cli or env var

use std::{fmt, path::PathBuf, time::Duration};

use anyhow::{Result, bail};
pub use clap::Parser;
use clap::{Subcommand, ValueEnum};
use config::{CoordinationConfig, Credentials};

/// tokio worker thread name
pub static DEFAULT_THREAD_NAME: &str = "coordctl-worker";
/// default log level. Can use this argument or COORD_LOG env var
pub const DEFAULT_COORD_LOG: &str = "info";
/// how long `lock` holds the lock when `--hold` is not given
pub const DEFAULT_HOLD: &str = "5s";

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(author, name = "coordctl", bin_name = "coordctl", version, about, long_about = None)]
/// read/write etcd configuration values and take distributed locks.
/// `.env` in the working directory is loaded as well
pub struct Config {
    /// path to a JSON or YAML coordination config
    #[arg(short, long, env)]
    pub config_path: Option<PathBuf>,
    /// comma separated etcd endpoints, overrides the config file
    #[arg(short, long, env = "COORD_ENDPOINTS", value_delimiter = ',')]
    pub endpoints: Vec<String>,
    /// per-request timeout, overrides the config file
    #[arg(long, env = "COORD_REQUEST_TIMEOUT", value_parser = parse_duration_arg)]
    pub request_timeout: Option<Duration>,
    /// ttl of the lease backing the session, overrides the config file
    #[arg(long, env = "COORD_SESSION_TTL", value_parser = parse_duration_arg)]
    pub session_ttl: Option<Duration>,
    /// etcd user, overrides the config file. Requires a password
    #[arg(long, env = "COORD_USERNAME", requires = "password")]
    pub username: Option<String>,
    /// etcd password
    #[arg(long, env = "COORD_PASSWORD", hide_env_values = true, value_parser = parse_password)]
    pub password: Option<Password>,
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[arg(long, env, default_value = DEFAULT_COORD_LOG)]
    pub coord_log: String,
    /// log output format
    #[arg(long, env, value_enum, default_value_t = LogFormat::Standard)]
    pub log_format: LogFormat,
    /// use a throwaway in-process store instead of etcd
    #[arg(long)]
    pub memory: bool,
    /// Worker thread name
    #[arg(long, env, default_value = DEFAULT_THREAD_NAME)]
    pub thread_name: String,
    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// apply cli overrides on top of the file (or default) config
    pub fn apply(&self, mut coord: CoordinationConfig) -> Result<CoordinationConfig> {
        if !self.endpoints.is_empty() {
            coord = coord.with_endpoints(self.endpoints.iter().cloned());
        }
        if let Some(timeout) = self.request_timeout {
            if timeout.is_zero() {
                bail!("--request-timeout must be non-zero");
            }
            coord = coord.with_request_timeout(timeout);
        }
        if let Some(ttl) = self.session_ttl {
            if ttl < Duration::from_secs(1) {
                bail!("--session-ttl must be at least 1s, got {ttl:?}");
            }
            coord = coord.with_session_ttl(ttl);
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            coord = coord.with_credentials(Some(Credentials {
                username: username.clone(),
                password: password.0.clone(),
            }));
        }
        Ok(coord)
    }
}

/// password that stays out of `Debug` output
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(..)")
    }
}

fn parse_password(s: &str) -> Result<Password, String> {
    Ok(Password(s.to_owned()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Standard,
    Json,
    Pretty,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// print a string value. Without --default any failure is an error
    Get {
        key: String,
        #[arg(short, long)]
        default: Option<String>,
    },
    /// print a 32-bit integer value
    GetInt {
        key: String,
        #[arg(short, long, allow_hyphen_values = true)]
        default: Option<i32>,
    },
    /// print a 64-bit integer value
    GetInt64 {
        key: String,
        #[arg(short, long, allow_hyphen_values = true)]
        default: Option<i64>,
    },
    /// store a 64-bit integer value
    SetInt64 {
        key: String,
        #[arg(allow_hyphen_values = true)]
        value: i64,
    },
    /// take a distributed lock, hold it, then release it
    Lock {
        name: String,
        /// how long to hold the lock, e.g. "500ms", "5s", "1m". ctrl-c releases early
        #[arg(long, value_parser = parse_duration_arg, default_value = DEFAULT_HOLD)]
        hold: Duration,
    },
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    config::parse_duration(s).map_err(|e| e.to_string())
}
