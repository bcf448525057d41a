//! `nodes.conf`-compatible cluster description parsing.
//!
//! Line-oriented, whitespace-separated:
//!
//! ```text
//! <id> <host>:<port>@<cport> <flags> <master-id> <ping-sent> <pong-recv> <epoch> <link-state> [slots…]
//! ```
//!
//! Slot tokens are `N`, `N-M`, or the bracketed `[N-<-id]` / `[N->-id]`
//! forms marking an importing/migrating slot. Bracketed slots make the node
//! *unstable*; strict router builds reject them.

use crate::cluster::slots::CLUSTER_SLOTS;
use crate::error::{Error, Result};

/// An inclusive range of hash slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    /// Start slot (inclusive).
    pub start: u16,
    /// End slot (inclusive).
    pub end: u16,
}

impl SlotRange {
    /// Create a range; single slots are `start == end`.
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Number of slots covered.
    pub fn count(&self) -> usize {
        (self.end - self.start + 1) as usize
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// One node record from a cluster description.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    /// 40-char hex node id.
    pub id: String,
    /// Announced host.
    pub host: String,
    /// Client port.
    pub port: u16,
    /// Cluster bus port, when announced.
    pub cport: Option<u16>,
    /// Raw flags (`myself`, `master`, `slave`, `fail?`, `noaddr`, …).
    pub flags: Vec<String>,
    /// Replica's master id, if any.
    pub master_id: Option<String>,
    /// Config epoch.
    pub epoch: u64,
    /// Link state (`connected` / `disconnected`).
    pub link_state: String,
    /// Owned slot ranges (masters only).
    pub slots: Vec<SlotRange>,
    /// True when any slot is mid-migration (`[N-<-id]` / `[N->-id]`).
    pub unstable: bool,
}

impl ClusterNode {
    /// Whether this record is a usable master (owns slots, has an address).
    pub fn is_master(&self) -> bool {
        self.flags.iter().any(|f| f == "master")
            && !self.flags.iter().any(|f| f == "noaddr" || f == "handshake")
    }

    /// `host:port` address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse a full `nodes.conf` document into node records.
///
/// The trailing `vars …` bookkeeping line and blank lines are skipped.
pub fn parse_nodes(text: &str) -> Result<Vec<ClusterNode>> {
    let mut nodes = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("vars ") {
            continue;
        }
        nodes.push(parse_node_line(line).map_err(|e| {
            Error::Config(format!("nodes.conf line {}: {}", lineno + 1, e))
        })?);
    }
    if nodes.is_empty() {
        return Err(Error::Config("nodes.conf contains no nodes".into()));
    }
    Ok(nodes)
}

fn parse_node_line(line: &str) -> std::result::Result<ClusterNode, String> {
    let mut fields = line.split_ascii_whitespace();

    let id = fields.next().ok_or("missing node id")?.to_string();
    let addr = fields.next().ok_or("missing address")?;
    let flags: Vec<String> = fields
        .next()
        .ok_or("missing flags")?
        .split(',')
        .map(str::to_string)
        .collect();
    let master_id = match fields.next().ok_or("missing master id")? {
        "-" => None,
        other => Some(other.to_string()),
    };
    let _ping_sent = fields.next().ok_or("missing ping-sent")?;
    let _pong_recv = fields.next().ok_or("missing pong-recv")?;
    let epoch: u64 = fields
        .next()
        .ok_or("missing epoch")?
        .parse()
        .map_err(|_| "invalid epoch")?;
    let link_state = fields.next().ok_or("missing link state")?.to_string();

    let (host, port, cport) = parse_addr(addr)?;

    let mut slots = Vec::new();
    let mut unstable = false;
    for token in fields {
        if token.starts_with('[') {
            // Importing/migrating marker: slot ownership is in flux.
            unstable = true;
            continue;
        }
        slots.push(parse_slot_range(token)?);
    }

    Ok(ClusterNode {
        id,
        host,
        port,
        cport,
        flags,
        master_id,
        epoch,
        link_state,
        slots,
        unstable,
    })
}

fn parse_addr(addr: &str) -> std::result::Result<(String, u16, Option<u16>), String> {
    let (hostport, cport) = match addr.split_once('@') {
        Some((hp, cp)) => {
            let cport = cp.parse::<u16>().map_err(|_| "invalid cluster bus port")?;
            (hp, Some(cport))
        }
        None => (addr, None),
    };
    let (host, port) = hostport
        .rsplit_once(':')
        .ok_or("address missing ':' separator")?;
    // `noaddr`/handshake records may carry an empty host; they are kept in
    // the parse and filtered by the router.
    let port = port.parse::<u16>().map_err(|_| "invalid port")?;
    Ok((host.to_string(), port, cport))
}

fn parse_slot_range(token: &str) -> std::result::Result<SlotRange, String> {
    let parse_slot = |s: &str| -> std::result::Result<u16, String> {
        let n: u32 = s.parse().map_err(|_| format!("invalid slot '{}'", s))?;
        if n >= CLUSTER_SLOTS as u32 {
            return Err(format!("slot {} out of range", n));
        }
        Ok(n as u16)
    };
    match token.split_once('-') {
        Some((lo, hi)) => {
            let start = parse_slot(lo)?;
            let end = parse_slot(hi)?;
            if end < start {
                return Err(format!("inverted slot range '{}'", token));
            }
            Ok(SlotRange::new(start, end))
        }
        None => {
            let slot = parse_slot(token)?;
            Ok(SlotRange::new(slot, slot))
        }
    }
}
