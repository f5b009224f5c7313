//! # etcd-coordination
//!
//! Configuration values and distributed locks backed by etcd.
//!
//! This library provides:
//! - **Coordination client** owning one connection and one lease-backed
//!   session, with typed scalar reads/writes bounded by a request timeout.
//! - **Distributed locks** returned as caller-owned [`LockGuard`]s, released
//!   explicitly, by scope ([`CoordinationClient::with_lock`]) or on drop.
//! - **Error taxonomy** that tells a missing key from a timeout, a transport
//!   failure or a value that does not parse, plus legacy accessors that
//!   collapse all of them into defaults and a two-valued [`StatusCode`].
//! - **Backends**: etcd v3 via `etcd-client`, and an in-process
//!   [`MemoryCluster`] for tests and dry runs.
//!
//! ```no_run
//! # async fn run() -> etcd_coordination::CoordinationResult<()> {
//! use etcd_coordination::{CoordinationClient, StatusCode};
//!
//! let client = CoordinationClient::new(config::CoordinationConfig::default());
//! client.init(&["127.0.0.1:2379"]).await?;
//!
//! assert_eq!(client.set_int64("cfg/x", 42).await, StatusCode::Ok);
//! assert_eq!(client.get_int64("cfg/x", -1).await, 42);
//!
//! let guard = client.lock("jobs").await?;
//! // critical section
//! guard.release().await?;
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod error;
pub mod etcd;
pub mod lock;
pub mod memory;
pub mod status;

// Re-export key types for convenient access
pub use backend::{Backend, Connector, KeyValue, SessionId};
pub use client::{ConnectionState, CoordinationClient};
pub use error::{CoordinationError, CoordinationResult};
pub use etcd::{EtcdBackend, EtcdConnector};
pub use lock::LockGuard;
pub use memory::{Fault, MemoryBackend, MemoryCluster};
pub use status::StatusCode;
