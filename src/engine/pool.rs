//! Per-lane endpoint pool.
//!
//! Each worker (lane) owns one `LanePool`: its private set of endpoints,
//! one per target address. The pool is the single point of endpoint
//! lookup — callers never hold an endpoint reference across a reconnect,
//! so a rebuilt endpoint transparently keeps its lane identity.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::engine::endpoint::{Endpoint, EndpointOptions};
use crate::error::{Error, Result};
use crate::metrics::{record_endpoint_failure, sanitize_addr, EngineStats};

/// The endpoints owned by one lane, keyed by `host:port` target address.
pub struct LanePool {
    opts: EndpointOptions,
    stats: Arc<EngineStats>,
    endpoints: HashMap<Arc<str>, Endpoint>,
    /// Cluster slot ownership per target; seeds endpoint state at open.
    slot_assignments: HashMap<Arc<str>, Vec<u16>>,
}

impl LanePool {
    /// An empty pool; endpoints open lazily on first use.
    pub fn new(opts: EndpointOptions, stats: Arc<EngineStats>) -> Self {
        Self {
            opts,
            stats,
            endpoints: HashMap::new(),
            slot_assignments: HashMap::new(),
        }
    }

    /// Record which slots each target owns (cluster mode).
    pub fn with_slot_assignments(mut self, assignments: HashMap<Arc<str>, Vec<u16>>) -> Self {
        self.slot_assignments = assignments;
        self
    }

    /// The endpoint for `addr`, opening it (with `SELECT db`) on first use.
    ///
    /// A failed open is counted as a `connect` failure before the error is
    /// returned; the next call retries.
    pub async fn ensure(&mut self, addr: &Arc<str>, db: i64) -> Result<&mut Endpoint> {
        if !self.endpoints.contains_key(addr) {
            let mut endpoint = self.open(addr, db).await?;
            if let Some(slots) = self.slot_assignments.get(addr) {
                endpoint.set_slots(slots.clone());
            }
            self.endpoints.insert(addr.clone(), endpoint);
        }
        Ok(self
            .endpoints
            .get_mut(addr)
            .expect("endpoint just inserted"))
    }

    /// Rebuild the endpoint for `addr`: the old connection is closed
    /// quietly, a reconnect is counted, and the fresh endpoint inherits the
    /// slot set and options. Selects `db` during the new handshake.
    pub async fn reopen(&mut self, addr: &Arc<str>, db: i64) -> Result<&mut Endpoint> {
        match self.endpoints.remove(addr) {
            Some(old) => {
                let fresh = Endpoint::reopen(old, db).await.map_err(|e| {
                    self.count_connect_failure(addr);
                    e
                })?;
                Ok(self.endpoints.entry(addr.clone()).or_insert(fresh))
            }
            // Nothing to rebuild; fall back to a plain open.
            None => self.ensure(addr, db).await,
        }
    }

    /// Drop the endpoint for `addr` without reconnecting.
    pub async fn discard(&mut self, addr: &Arc<str>) {
        if let Some(mut endpoint) = self.endpoints.remove(addr) {
            endpoint.close().await;
        }
    }

    /// Drain every endpoint's pending batch. An endpoint that fails to
    /// drain is rebuilt in place (its inflight batch is lost) — the lost
    /// commands are reported back per address.
    pub async fn drain(&mut self) -> Vec<(Arc<str>, usize)> {
        let mut lost = Vec::new();
        let addrs: Vec<Arc<str>> = self.endpoints.keys().cloned().collect();
        for addr in addrs {
            let Some(endpoint) = self.endpoints.get_mut(&addr) else {
                continue;
            };
            let pending = endpoint.inflight();
            if pending == 0 {
                continue;
            }
            if let Err(e) = endpoint.flush().await {
                warn!(
                    endpoint = %addr,
                    pending, "drain failed, rebuilding endpoint: {}", e
                );
                lost.push((addr.clone(), pending));
                let db = endpoint.db();
                if self.reopen(&addr, db).await.is_err() {
                    self.endpoints.remove(&addr);
                }
            }
        }
        lost
    }

    /// Close every endpoint, draining pending batches first.
    pub async fn close_all(&mut self) {
        self.drain().await;
        for (_, mut endpoint) in self.endpoints.drain() {
            endpoint.close().await;
        }
    }

    /// Commands currently batched on the endpoint for `addr`, if open.
    pub fn inflight_of(&self, addr: &Arc<str>) -> usize {
        self.endpoints.get(addr).map_or(0, Endpoint::inflight)
    }

    /// Number of open endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether the pool has no open endpoints.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    async fn open(&self, addr: &Arc<str>, db: i64) -> Result<Endpoint> {
        let (host, port) = split_addr(addr)?;
        Endpoint::open(host, port, db, self.opts.clone(), self.stats.clone())
            .await
            .map_err(|e| {
                self.count_connect_failure(addr);
                e
            })
    }

    fn count_connect_failure(&self, addr: &Arc<str>) {
        self.stats
            .failures
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if self.opts.statistics {
            if let Ok((host, port)) = split_addr(addr) {
                record_endpoint_failure(&sanitize_addr(host, port), "connect");
            }
        }
    }
}

/// Split `host:port` into parts.
fn split_addr(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("bad target address '{}'", addr)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::Config(format!("bad port in target address '{}'", addr)))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_addr() {
        assert_eq!(split_addr("127.0.0.1:6379").unwrap(), ("127.0.0.1", 6379));
        assert_eq!(split_addr("::1:6380").unwrap(), ("::1", 6380));
        assert!(split_addr("no-port").is_err());
        assert!(split_addr("host:notaport").is_err());
    }
}
