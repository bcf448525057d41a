//! Lane workers.
//!
//! Each worker drives one lane: it consumes work items from its bounded
//! queue, batches `SELECT`/`RESTORE`/replicated commands onto its private
//! endpoints, and owns the retry/reconnect policy for them. A lane's
//! endpoints are never touched by another task, so per-lane submission
//! order is the server-observed order.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::engine::pool::LanePool;
use crate::engine::RestoreMode;
use crate::error::{Error, Result};
use crate::resp::{Arg, Reply};

/// Atomic DEL+RESTORE for targets without `RESTORE … REPLACE` support.
const LEGACY_RESTORE_SCRIPT: &str =
    "redis.call('DEL', KEYS[1]) return redis.call('RESTORE', KEYS[1], ARGV[1], ARGV[2])";

/// One unit of work routed to a lane.
#[derive(Debug)]
pub(crate) enum WorkItem {
    /// Open and verify the endpoint for a target up front (`BeginRdb`).
    Open { target: Arc<str> },
    /// Restore one key/value record.
    Restore {
        target: Arc<str>,
        db: i64,
        key: Bytes,
        ttl_ms: u64,
        dump: Vec<Bytes>,
    },
    /// Replay a replicated command verbatim.
    Command {
        target: Arc<str>,
        db: i64,
        argv: Vec<Bytes>,
    },
    /// Drain every endpoint's pending batch (`EndRdb`).
    Drain,
}

/// Per-worker delivery accounting, merged into the engine report.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WorkerTally {
    /// Commands handed to an endpoint.
    pub delivered: u64,
    /// Re-emissions after a reconnect.
    pub retried: u64,
    /// Commands lost to endpoint faults (including batched casualties).
    pub lost: u64,
}

impl WorkerTally {
    fn merge(&mut self, other: WorkerTally) {
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.lost += other.lost;
    }
}

/// Whether a delivery reached an endpoint.
enum Delivery {
    Sent,
    Lost,
}

pub(crate) struct Worker {
    id: usize,
    rx: mpsc::Receiver<WorkItem>,
    pool: LanePool,
    restore_mode: RestoreMode,
    flush_per_command: bool,
    retries: u32,
    tally: WorkerTally,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        rx: mpsc::Receiver<WorkItem>,
        pool: LanePool,
        restore_mode: RestoreMode,
        flush_per_command: bool,
        retries: u32,
    ) -> Self {
        Self {
            id,
            rx,
            pool,
            restore_mode,
            flush_per_command,
            retries,
            tally: WorkerTally::default(),
        }
    }

    /// Consume work items until the queue closes, then drain and shut down.
    ///
    /// Only fatal errors (auth, config) abort the worker; endpoint faults
    /// are absorbed by the reconnect policy.
    pub(crate) async fn run(mut self) -> Result<WorkerTally> {
        loop {
            let item = match self.rx.try_recv() {
                Ok(item) => item,
                Err(mpsc::error::TryRecvError::Empty) => {
                    // Idle lane: drain pending batches so a partial pipe
                    // budget does not hold sparse traffic hostage.
                    self.drain().await;
                    match self.rx.recv().await {
                        Some(item) => item,
                        None => break,
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            };
            self.handle(item).await?;
        }
        debug!(lane = self.id, "lane shutting down");
        self.drain().await;
        self.pool.close_all().await;
        Ok(self.tally)
    }

    async fn handle(&mut self, item: WorkItem) -> Result<()> {
        match item {
            WorkItem::Open { target } => {
                // Startup verification: an unreachable target here is an
                // operator problem, not a transient endpoint fault.
                self.pool.ensure(&target, 0).await?;
                Ok(())
            }
            WorkItem::Drain => {
                self.drain().await;
                Ok(())
            }
            WorkItem::Restore {
                target,
                db,
                key,
                ttl_ms,
                dump,
            } => self.restore(&target, db, key, ttl_ms, dump).await,
            WorkItem::Command { target, db, argv } => {
                let argv: Vec<Arg> = argv.into_iter().map(Arg::Plain).collect();
                self.deliver(&target, db, &argv).await?;
                Ok(())
            }
        }
    }

    async fn drain(&mut self) {
        for (addr, pending) in self.pool.drain().await {
            warn!(lane = self.id, endpoint = %addr, pending, "batch lost on drain");
            self.tally.lost += pending as u64;
        }
    }

    async fn restore(
        &mut self,
        target: &Arc<str>,
        db: i64,
        key: Bytes,
        ttl_ms: u64,
        dump: Vec<Bytes>,
    ) -> Result<()> {
        if self.restore_mode == RestoreMode::Fallback {
            return self.restore_fallback(target, db, key, ttl_ms, dump).await;
        }
        let argv = self.restore_argv(&key, ttl_ms, dump);
        self.deliver(target, db, &argv).await?;
        Ok(())
    }

    fn restore_argv(&self, key: &Bytes, ttl_ms: u64, dump: Vec<Bytes>) -> Vec<Arg> {
        let ttl = Arg::Plain(Bytes::from(ttl_ms.to_string()));
        match self.restore_mode {
            RestoreMode::Insert | RestoreMode::Fallback => vec![
                Arg::from("RESTORE"),
                Arg::Plain(key.clone()),
                ttl,
                Arg::Chunked(dump),
            ],
            RestoreMode::Replace => vec![
                Arg::from("RESTORE"),
                Arg::Plain(key.clone()),
                ttl,
                Arg::Chunked(dump),
                Arg::from("REPLACE"),
            ],
            RestoreMode::Legacy => vec![
                Arg::from("EVAL"),
                Arg::from(LEGACY_RESTORE_SCRIPT),
                Arg::from("1"),
                Arg::Plain(key.clone()),
                ttl,
                Arg::Chunked(dump),
            ],
        }
    }

    /// Plain `RESTORE`, falling back to `DEL` + `RESTORE` when the target
    /// reports an existing key. Requires per-command flush (validated at
    /// engine construction) so each reply is attributable.
    async fn restore_fallback(
        &mut self,
        target: &Arc<str>,
        db: i64,
        key: Bytes,
        ttl_ms: u64,
        dump: Vec<Bytes>,
    ) -> Result<()> {
        let argv = self.restore_argv(&key, ttl_ms, dump);
        let Some(reply) = self.exchange(target, db, &argv).await? else {
            return Ok(());
        };
        let busy = reply
            .error_text()
            .is_some_and(|t| t.starts_with("BUSYKEY"));
        if !busy {
            self.classify(target, db, &reply).await;
            return Ok(());
        }

        debug!(lane = self.id, "existing key, falling back to DEL + RESTORE");
        let del = vec![Arg::from("DEL"), Arg::Plain(key.clone())];
        match self.exchange(target, db, &del).await? {
            Some(reply) => self.classify(target, db, &reply).await,
            None => return Ok(()),
        }
        if let Some(reply) = self.exchange(target, db, &argv).await? {
            self.classify(target, db, &reply).await;
        }
        Ok(())
    }

    /// Pipeline one command onto the target's endpoint, reconnecting and —
    /// under per-command flush — re-emitting up to `retries` times.
    async fn deliver(&mut self, target: &Arc<str>, db: i64, argv: &[Arg]) -> Result<Delivery> {
        let allowed_faults = if self.flush_per_command { self.retries } else { 0 };
        let mut faults: u32 = 0;
        loop {
            match emit(&mut self.pool, target, db, self.flush_per_command, argv).await {
                Ok(()) => {
                    self.tally.delivered += 1;
                    return Ok(Delivery::Sent);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if e.is_io_class() => {
                    faults += 1;
                    if !self.recover(target, db, &e).await? || faults > allowed_faults {
                        self.tally.lost += 1;
                        return Ok(Delivery::Lost);
                    }
                    self.tally.retried += 1;
                }
                Err(e) => {
                    // The lazy open failed; the next item retriggers it.
                    warn!(
                        lane = self.id,
                        endpoint = %target,
                        "endpoint unavailable, dropping command: {}", e
                    );
                    self.tally.lost += 1;
                    return Ok(Delivery::Lost);
                }
            }
        }
    }

    /// Single-shot variant of [`Self::deliver`] that returns the reply,
    /// for paths that must inspect it. `None` means the command was lost.
    async fn exchange(
        &mut self,
        target: &Arc<str>,
        db: i64,
        argv: &[Arg],
    ) -> Result<Option<Reply>> {
        let allowed_faults = self.retries;
        let mut faults: u32 = 0;
        loop {
            match emit_synced(&mut self.pool, target, db, argv).await {
                Ok(reply) => {
                    self.tally.delivered += 1;
                    return Ok(Some(reply));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if e.is_io_class() => {
                    faults += 1;
                    if !self.recover(target, db, &e).await? || faults > allowed_faults {
                        self.tally.lost += 1;
                        return Ok(None);
                    }
                    self.tally.retried += 1;
                }
                Err(e) => {
                    warn!(
                        lane = self.id,
                        endpoint = %target,
                        "endpoint unavailable, dropping command: {}", e
                    );
                    self.tally.lost += 1;
                    return Ok(None);
                }
            }
        }
    }

    /// Rebuild the target's endpoint after an I/O fault. Returns `false`
    /// when the rebuild failed; the command in flight is then dropped.
    async fn recover(&mut self, target: &Arc<str>, db: i64, cause: &Error) -> Result<bool> {
        // Other commands batched on the dead connection go down with it;
        // the faulting command itself is retried or counted by the caller.
        let casualties = self.pool.inflight_of(target).saturating_sub(1);
        if casualties > 0 {
            self.tally.lost += casualties as u64;
        }
        warn!(
            lane = self.id,
            endpoint = %target,
            casualties, "endpoint fault, reconnecting: {}", cause
        );
        match self.pool.reopen(target, db).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!(lane = self.id, endpoint = %target, "reconnect failed: {}", e);
                self.pool.discard(target).await;
                Ok(false)
            }
        }
    }

    async fn classify(&mut self, target: &Arc<str>, db: i64, reply: &Reply) {
        if let Ok(endpoint) = self.pool.ensure(target, db).await {
            endpoint.classify(reply);
        }
    }
}

/// Select the event's database if needed, then batch the command.
async fn emit(
    pool: &mut LanePool,
    target: &Arc<str>,
    db: i64,
    force: bool,
    argv: &[Arg],
) -> Result<()> {
    let endpoint = pool.ensure(target, db).await?;
    if endpoint.db() != db {
        endpoint.select_batched(force, db).await?;
    }
    endpoint.batch(force, argv).await
}

/// Like [`emit`] but single-shot: pending replies are drained first, and
/// the command's own reply is returned.
async fn emit_synced(
    pool: &mut LanePool,
    target: &Arc<str>,
    db: i64,
    argv: &[Arg],
) -> Result<Reply> {
    let endpoint = pool.ensure(target, db).await?;
    if endpoint.db() != db {
        endpoint.select_batched(true, db).await?;
    }
    endpoint.send_argv(argv).await
}

/// Merge worker tallies into totals for the engine report.
pub(crate) fn merge_tallies(tallies: impl IntoIterator<Item = WorkerTally>) -> WorkerTally {
    let mut total = WorkerTally::default();
    for tally in tallies {
        total.merge(tally);
    }
    total
}
