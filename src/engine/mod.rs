//! The migration engine: demultiplexer, lanes, and lifecycle.
//!
//! A single demultiplexer pulls upstream events, applies the filter set,
//! resolves each event to an owning target (cluster slot routing) and a
//! lane (`slot % migrate_threads`), and pushes work items into per-lane
//! bounded queues. One worker task drives each lane; back-pressure is the
//! queue. Per-key ordering holds because a key always hashes to the same
//! lane and the same owner.

pub mod endpoint;
pub mod keyspec;
pub mod pool;
mod worker;

pub use endpoint::{Endpoint, EndpointOptions, TlsOptions};
pub use pool::LanePool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{parse_nodes, ClusterNode, SlotRouter};
use crate::cluster::slots::slot_of;
use crate::config::{FlushPolicy, MigrateConfig, RedisUrl};
use crate::error::{Error, Result};
use crate::event::{Event, EventSource};
use crate::filter::FilterSet;
use crate::metrics::{record_endpoint_failure, EngineStats};
use worker::{merge_tallies, WorkItem, Worker, WorkerTally};

/// How key/value records are written into the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    /// Plain `RESTORE`; an existing key surfaces as a counted failure.
    #[default]
    Insert,
    /// `RESTORE … REPLACE`.
    Replace,
    /// Plain `RESTORE`, retried as `DEL` + `RESTORE` on `BUSYKEY`.
    Fallback,
    /// `EVAL` of an atomic DEL+RESTORE script, for pre-3.0 targets.
    Legacy,
}

/// Where the migrated data goes.
#[derive(Debug, Clone)]
pub enum Target {
    /// One standalone server.
    Standalone(RedisUrl),
    /// A cluster, described by its parsed node records.
    Cluster(Vec<ClusterNode>),
}

impl Target {
    /// Parse a `nodes.conf`-style document into a cluster target.
    pub fn cluster_from_conf(text: &str) -> Result<Self> {
        Ok(Target::Cluster(parse_nodes(text)?))
    }
}

/// Everything the engine needs to run.
#[derive(Debug)]
pub struct EngineOptions {
    /// The fixed-key migration configuration.
    pub config: MigrateConfig,
    /// Standalone or cluster target.
    pub target: Target,
    /// Restore write mode.
    pub restore: RestoreMode,
    /// Event filter set.
    pub filter: FilterSet,
    /// Reject cluster descriptions with slots in migration.
    pub strict_cluster: bool,
}

impl EngineOptions {
    /// Options with the default config and empty filter for a target.
    pub fn new(target: Target) -> Self {
        Self {
            config: MigrateConfig::default(),
            target,
            restore: RestoreMode::default(),
            filter: FilterSet::new(),
            strict_cluster: true,
        }
    }
}

/// Final accounting for one engine run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineReport {
    /// Upstream events consumed.
    pub events: u64,
    /// Key/value records enqueued for restore.
    pub restored: u64,
    /// Replicated commands enqueued.
    pub commands: u64,
    /// Events rejected by the filter set.
    pub filtered: u64,
    /// Cluster-mode commands dropped for spanning slots.
    pub dropped_cross_slot: u64,
    /// Commands handed to endpoints.
    pub delivered: u64,
    /// Re-emissions after reconnects.
    pub retried: u64,
    /// Commands lost to endpoint faults.
    pub lost: u64,
    /// Forced endpoint writes.
    pub sends: u64,
    /// Non-error replies drained.
    pub successes: u64,
    /// Failures of any reason.
    pub failures: u64,
    /// Endpoint rebuilds.
    pub reconnects: u64,
}

impl EngineReport {
    /// `true` when no failure of any class was observed.
    pub fn is_clean(&self) -> bool {
        self.failures == 0 && self.lost == 0 && self.dropped_cross_slot == 0
    }
}

/// Requests a graceful stop of a running engine (sync-follow mode).
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    /// Stop after the current event; lanes drain and close.
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// The migration engine. See the module docs for the data flow.
pub struct MigrationEngine {
    opts: EngineOptions,
    router: Option<Arc<SlotRouter>>,
    stats: Arc<EngineStats>,
    stop: Arc<AtomicBool>,
}

impl MigrationEngine {
    /// Validate options and build the slot router for cluster targets.
    pub fn new(opts: EngineOptions) -> Result<Self> {
        opts.config.validate()?;
        if opts.restore == RestoreMode::Fallback
            && opts.config.migrate_flush != FlushPolicy::PerCommand
        {
            return Err(Error::Config(
                "restore fallback requires migrate_flush = yes".into(),
            ));
        }
        let router = match &opts.target {
            Target::Standalone(_) => None,
            Target::Cluster(nodes) => {
                let router = SlotRouter::build(nodes, opts.strict_cluster)?;
                info!(masters = router.addrs().len(), "cluster slot map built");
                Some(Arc::new(router))
            }
        };
        Ok(Self {
            opts,
            router,
            stats: Arc::new(EngineStats::default()),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shared counters for this run.
    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    /// Handle for requesting a graceful stop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.stop.clone())
    }

    /// Drive the event stream to completion.
    ///
    /// Returns when the source is exhausted (migration mode) or a shutdown
    /// is requested (sync-follow mode), after every lane has drained and
    /// closed its endpoints. `Err` means a fatal class fired; per-endpoint
    /// faults are absorbed and reported in the [`EngineReport`].
    pub async fn run<S: EventSource>(self, mut source: S) -> Result<EngineReport> {
        let threads = self.opts.config.migrate_threads;
        let queue_cap = self.opts.config.lane_queue_capacity();
        let endpoint_opts = self.endpoint_options();

        let slot_assignments = self
            .router
            .as_ref()
            .map(|router| router.slot_assignments())
            .unwrap_or_default();

        let mut lanes: Vec<mpsc::Sender<WorkItem>> = Vec::with_capacity(threads);
        let mut workers: Vec<JoinHandle<Result<WorkerTally>>> = Vec::with_capacity(threads);
        for lane in 0..threads {
            let (tx, rx) = mpsc::channel(queue_cap);
            let pool = LanePool::new(endpoint_opts.clone(), self.stats.clone())
                .with_slot_assignments(slot_assignments.clone());
            let worker = Worker::new(
                lane,
                rx,
                pool,
                self.opts.restore,
                self.opts.config.migrate_flush == FlushPolicy::PerCommand,
                self.opts.config.migrate_retries,
            );
            workers.push(tokio::spawn(worker.run()));
            lanes.push(tx);
        }

        let targets: Vec<Arc<str>> = match (&self.opts.target, &self.router) {
            (Target::Standalone(url), _) => vec![url.addr().into()],
            (Target::Cluster(_), Some(router)) => router.addrs().to_vec(),
            (Target::Cluster(_), None) => unreachable!("router built in new()"),
        };

        let mut report = EngineReport::default();
        let demux = self.demux(&mut source, &lanes, &targets, &mut report);
        let demux_result = demux.await;

        drop(lanes);

        // Worker errors outrank the demux error: a closed lane queue is
        // usually the symptom of the worker's own fatal failure.
        let mut fatal: Option<Error> = None;
        let mut tallies: Vec<WorkerTally> = Vec::with_capacity(threads);
        for handle in workers {
            match handle.await {
                Ok(Ok(tally)) => tallies.push(tally),
                Ok(Err(e)) => {
                    warn!("lane failed: {}", e);
                    fatal.get_or_insert(e);
                }
                Err(join) => {
                    fatal.get_or_insert(Error::Config(format!("lane panicked: {}", join)));
                }
            }
        }
        if fatal.is_none() {
            fatal = demux_result.err();
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let totals = merge_tallies(tallies);
        report.delivered = totals.delivered;
        report.retried = totals.retried;
        report.lost = totals.lost;
        let snapshot = self.stats.snapshot();
        report.sends = snapshot.sends;
        report.successes = snapshot.successes;
        report.failures = snapshot.failures;
        report.reconnects = snapshot.reconnects;
        info!(
            events = report.events,
            restored = report.restored,
            commands = report.commands,
            failures = report.failures,
            reconnects = report.reconnects,
            "engine run complete"
        );
        Ok(report)
    }

    /// The event loop: pull, filter, route, enqueue.
    async fn demux<S: EventSource>(
        &self,
        source: &mut S,
        lanes: &[mpsc::Sender<WorkItem>],
        targets: &[Arc<str>],
        report: &mut EngineReport,
    ) -> Result<()> {
        let threads = lanes.len();
        // Database the replication stream is currently positioned in.
        let mut stream_db: i64 = 0;
        // Round-robin cursor for keyless commands (standalone mode).
        let mut next_keyless_lane: usize = 0;

        while let Some(event) = source.next().await? {
            if self.stop.load(Ordering::Relaxed) {
                info!("shutdown requested, draining lanes");
                break;
            }
            report.events += 1;
            match event {
                Event::BeginRdb => {
                    debug!("snapshot stream started");
                    for lane in lanes {
                        for target in targets {
                            send(lane, WorkItem::Open { target: target.clone() }).await?;
                        }
                    }
                }
                Event::EndRdb => {
                    debug!("snapshot stream finished");
                    for lane in lanes {
                        send(lane, WorkItem::Drain).await?;
                    }
                }
                Event::KeyValue {
                    db,
                    key,
                    rtype,
                    ttl_ms,
                    dump,
                } => {
                    if !self.opts.filter.admits_key_value(db, rtype, &key) {
                        report.filtered += 1;
                        continue;
                    }
                    let slot = slot_of(&key);
                    let target = self.owner_of_slot(slot, targets);
                    let item = WorkItem::Restore {
                        target,
                        db,
                        key,
                        ttl_ms,
                        dump,
                    };
                    send(&lanes[slot as usize % threads], item).await?;
                    report.restored += 1;
                }
                Event::Command { db, argv } => {
                    self.route_command(
                        db,
                        argv,
                        lanes,
                        targets,
                        &mut stream_db,
                        &mut next_keyless_lane,
                        report,
                    )
                    .await?;
                }
                Event::StreamCommand { argv } => {
                    let db = stream_db;
                    self.route_command(
                        db,
                        argv,
                        lanes,
                        targets,
                        &mut stream_db,
                        &mut next_keyless_lane,
                        report,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn route_command(
        &self,
        db: i64,
        argv: Vec<Bytes>,
        lanes: &[mpsc::Sender<WorkItem>],
        targets: &[Arc<str>],
        stream_db: &mut i64,
        next_keyless_lane: &mut usize,
        report: &mut EngineReport,
    ) -> Result<()> {
        if argv.is_empty() {
            return Ok(());
        }

        // A replicated SELECT repositions the stream; endpoints issue their
        // own SELECTs per batch, so it is consumed here rather than fanned
        // out across lanes.
        if argv[0].eq_ignore_ascii_case(b"SELECT") && argv.len() == 2 {
            if let Some(db) = std::str::from_utf8(&argv[1])
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
            {
                *stream_db = db;
            }
            return Ok(());
        }

        let keys = keyspec::command_keys(&argv);
        if !self
            .opts
            .filter
            .admits_command(db, keys.first().map(|k| k.as_ref()))
        {
            report.filtered += 1;
            return Ok(());
        }

        let threads = lanes.len();
        let (target, lane) = match &self.router {
            Some(router) => {
                if keys.is_empty() {
                    // Keyless commands have no owner; pin them to the
                    // slot-0 master's default lane.
                    debug!(
                        command = %String::from_utf8_lossy(&argv[0]),
                        "keyless command pinned to default owner"
                    );
                    (router.owner_of_slot(0).clone(), 0)
                } else {
                    match router.same_slot(&keys) {
                        Some(slot) => (
                            router.owner_of_slot(slot).clone(),
                            slot as usize % threads,
                        ),
                        None => {
                            warn!(
                                command = %String::from_utf8_lossy(&argv[0]),
                                "dropping cross-slot command in cluster mode"
                            );
                            self.stats
                                .failures
                                .fetch_add(1, Ordering::Relaxed);
                            record_endpoint_failure("cluster", "cross-slot");
                            report.dropped_cross_slot += 1;
                            return Ok(());
                        }
                    }
                }
            }
            None => {
                let lane = match keys.first() {
                    Some(key) => slot_of(key) as usize % threads,
                    None => {
                        let lane = *next_keyless_lane % threads;
                        *next_keyless_lane = next_keyless_lane.wrapping_add(1);
                        lane
                    }
                };
                (targets[0].clone(), lane)
            }
        };

        send(&lanes[lane], WorkItem::Command { target, db, argv }).await?;
        report.commands += 1;
        Ok(())
    }

    fn owner_of_slot(&self, slot: u16, targets: &[Arc<str>]) -> Arc<str> {
        match &self.router {
            Some(router) => router.owner_of_slot(slot).clone(),
            None => targets[0].clone(),
        }
    }

    fn endpoint_options(&self) -> EndpointOptions {
        let config = &self.opts.config;
        let tls = match &self.opts.target {
            Target::Standalone(url) if url.tls => Some(TlsOptions {
                ca_file: config.tls.ca_file.clone(),
            }),
            _ => None,
        };
        EndpointOptions {
            pipe_budget: config.migrate_batch_size,
            flush_per_command: config.migrate_flush == FlushPolicy::PerCommand,
            auth_user: config.auth_user.clone(),
            auth_password: config.auth_password.clone(),
            connect_timeout: config.connection_timeout(),
            statistics: true,
            tls,
        }
    }
}

/// Push one item, surfacing a dead lane as the worker's own error later.
async fn send(lane: &mpsc::Sender<WorkItem>, item: WorkItem) -> Result<()> {
    lane.send(item)
        .await
        .map_err(|_| Error::Config("lane queue closed unexpectedly".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrateConfig;

    fn standalone_opts() -> EngineOptions {
        EngineOptions::new(Target::Standalone(
            RedisUrl::parse("redis://127.0.0.1:6379").unwrap(),
        ))
    }

    #[test]
    fn test_new_validates_config() {
        let mut opts = standalone_opts();
        opts.config = MigrateConfig {
            migrate_retries: 2,
            migrate_flush: FlushPolicy::Buffered,
            ..MigrateConfig::default()
        };
        assert!(matches!(
            MigrationEngine::new(opts),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_fallback_requires_per_command_flush() {
        let mut opts = standalone_opts();
        opts.restore = RestoreMode::Fallback;
        opts.config.migrate_flush = FlushPolicy::Buffered;
        opts.config.migrate_retries = 0;
        assert!(matches!(
            MigrationEngine::new(opts),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_cluster_target_builds_router() {
        let nodes = crate::cluster::parse_nodes(
            "a 10.0.0.1:7000 master - 0 0 1 connected 0-16383",
        )
        .unwrap();
        let opts = EngineOptions::new(Target::Cluster(nodes));
        let engine = MigrationEngine::new(opts).unwrap();
        assert!(engine.router.is_some());
    }

    #[test]
    fn test_report_cleanliness() {
        let mut report = EngineReport::default();
        assert!(report.is_clean());
        report.dropped_cross_slot = 1;
        assert!(!report.is_clean());
    }
}
