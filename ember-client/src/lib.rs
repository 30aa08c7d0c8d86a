//! Async Rust client for a partitioned, replicated key-value store.
//!
//! Documents are spread over 1024 vbuckets; the client keeps a snapshot of
//! which node owns each vbucket and talks to that node directly over a
//! multiplexed binary protocol. On top of single-document operations it
//! offers multi-document ACID transactions built only from per-document CAS.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ember_client::{ClientConfig, Cluster, GetOptions, UpsertOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .bucket("travel")
//!         .add_address("127.0.0.1:11210".parse()?)
//!         .build()?;
//!     let cluster = Cluster::connect(config).await?;
//!
//!     let users = cluster.collection("app.users".parse()?);
//!     users.upsert("user::1", &serde_json::json!({"name": "ada"}), UpsertOptions::new()).await?;
//!     let doc = users.get("user::1", GetOptions::new()).await?;
//!     println!("cas={} body={:?}", doc.cas(), doc.content());
//!
//!     cluster.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Operations
//!
//! | Operation | Method | Retried on transient errors |
//! |-----------|--------|-----------------------------|
//! | Read | [`Collection::get`], [`Collection::exists`], [`Collection::lookup_in`] | always |
//! | Write | [`Collection::upsert`], [`Collection::insert`], [`Collection::replace`], [`Collection::remove`] | only when idempotent |
//! | Counters | [`Collection::increment`], [`Collection::decrement`] | no |
//! | Sub-document | [`Collection::mutate_in`] | only when CAS-guarded |
//!
//! A non-idempotent write whose request reached the wire but whose response
//! never came back fails with
//! [`EmberError::AmbiguousTimeout`](ember_core::EmberError::AmbiguousTimeout)
//! instead of being sent again.
//!
//! # Configuration
//!
//! ```rust,no_run
//! use ember_client::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig::builder()
//!     .bucket("travel")
//!     .add_address("10.0.0.1:11210".parse().unwrap())
//!     .credentials("app", "secret")
//!     .retry(|r| r
//!         .initial_backoff(Duration::from_millis(2))
//!         .max_backoff(Duration::from_millis(200))
//!         .max_attempts(6))
//!     .timeouts(|t| t.kv_timeout(Duration::from_secs(1)))
//!     .build()
//!     .expect("invalid config");
//! ```
//!
//! Configuration can also be read from the environment with
//! [`ClientConfig::from_env`], or from YAML and TOML files with the
//! `config-file` feature.
//!
//! # Transactions
//!
//! See the [`transaction`] module.
//!
//! # Feature Flags
//!
//! - `metrics`: Prometheus recorder for operation telemetry ([`ClientMetrics`])
//! - `config-file`: YAML and TOML configuration loading

#![warn(missing_docs)]

mod backoff;
pub mod client;
pub mod cluster;
pub mod collection;
pub mod config;
pub mod config_file;
pub mod connection;
pub mod diagnostics;
pub mod dispatch;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod transaction;

pub use client::Cluster;
pub use cluster::{CollectionManifest, Topology};
pub use collection::{
    Collection, ConcatOptions, CounterOptions, CounterResult, ExistsOptions, ExistsResult,
    GetOptions, GetResult, InsertOptions, LookupInOptions, LookupInResult, MutateInOptions,
    MutateInResult, MutationResult, RemoveOptions, ReplaceOptions, TouchOptions, UnlockOptions,
    UpsertOptions,
};
pub use config::{
    ClientConfig, ClientConfigBuilder, ConfigError, DiagnosticsConfig, NetworkConfig,
    RetryConfig, SecurityConfig, TimeoutConfig, TransactionsConfig,
};
pub use connection::{ConnectionEvent, ConnectionManager, EndpointState};
pub use diagnostics::{
    CompositeTelemetry, EndpointPing, OperationEvent, OperationOutcome, PingReport,
    SlowOperationDetector, Telemetry, TracingTelemetry,
};
pub use dispatch::{DispatchOptions, Dispatcher, Operation};
#[cfg(feature = "metrics")]
pub use metrics::{ClientMetrics, MetricsError};
pub use transaction::{
    AttemptContext, KvStore, MemoryStore, TransactionGetResult, TransactionOptions,
    TransactionResult, TransactionState, Transactions,
};

pub use ember_core::protocol::{LookupInSpec, MutateInSpec, StoreSemantics};
pub use ember_core::{CollectionName, DurabilityLevel, EmberError, ErrorCategory, Result};
