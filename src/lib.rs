//! # rdbshift — streaming migration engine for Redis snapshots
//!
//! rdbshift turns an ordered stream of RDB key/value records and replicated
//! commands into pipelined `RESTORE`/`DEL`/`SELECT` traffic against one or
//! more live Redis targets, standalone or cluster.
//!
//! ## Features
//!
//! - **Pipelined endpoints** — explicit batch boundaries, per-endpoint pipe
//!   budgets, FIFO reply draining, socket-level reconnect with optional
//!   re-emission of the failed command
//! - **Cluster routing** — CRC16 slot hashing with hash-tag support,
//!   `nodes.conf` parsing into a total slot→owner map, cross-slot command
//!   rejection
//! - **Lane fan-out** — deterministic key→lane sharding preserves per-key
//!   ordering; bounded queues provide back-pressure to the snapshot reader
//! - **Filters** — by database, value type, and key regex
//! - **Observability** — per-endpoint send/success/failure/reconnect
//!   counters through the `metrics` facade, with an optional exposition
//!   gateway
//! - **TLS** — optional, via the `tls` feature flag (`rediss://` targets)
//!
//! The RDB decoder, replication client, and CLI live outside this crate:
//! they feed the engine through [`EventSource`] (pull) or
//! [`ChannelSource`] (push).
//!
//! ## Quick start
//!
//! ```ignore
//! use rdbshift::{EngineOptions, MigrationEngine, RedisUrl, RestoreMode, Target};
//!
//! #[tokio::main]
//! async fn main() -> rdbshift::Result<()> {
//!     let target = Target::Standalone(RedisUrl::parse("redis://127.0.0.1:6379")?);
//!     let mut options = EngineOptions::new(target);
//!     options.restore = RestoreMode::Replace;
//!
//!     let engine = MigrationEngine::new(options)?;
//!     let report = engine.run(my_rdb_event_source()).await?;
//!     println!("restored {} keys", report.restored);
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod filter;
pub mod metrics;
pub mod resp;

// ── Re-exports for ergonomic top-level usage ────────────────────────────────

pub use cluster::{parse_nodes, slot_of, ClusterNode, SlotRouter, CLUSTER_SLOTS};
pub use config::{FlushPolicy, MigrateConfig, RedisUrl};
pub use engine::{
    Endpoint, EndpointOptions, EngineOptions, EngineReport, MigrationEngine, RestoreMode,
    ShutdownHandle, Target, TlsOptions,
};
pub use error::{Error, Result};
pub use event::{ChannelSource, Event, EventSource, RecordType, VecSource};
pub use filter::FilterSet;
pub use metrics::{EngineStats, MetricGateway, MetricsServer, StatsSnapshot};
pub use resp::{Arg, Reply};
