//! The upstream event contract.
//!
//! The RDB decoder and the replication client live outside this crate; they
//! feed the engine an ordered stream of [`Event`]s, either by implementing
//! [`EventSource`] (pull) or by pushing into a [`ChannelSource`].

use std::collections::HashSet;
use std::future::Future;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// The Redis value type of a snapshot record, as reported by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    /// Plain string.
    String,
    /// List.
    List,
    /// Set.
    Set,
    /// Sorted set.
    #[serde(alias = "sortedset")]
    Zset,
    /// Hash.
    Hash,
    /// Stream.
    Stream,
    /// Module-defined type (opaque).
    Module,
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordType::String => "string",
            RecordType::List => "list",
            RecordType::Set => "set",
            RecordType::Zset => "zset",
            RecordType::Hash => "hash",
            RecordType::Stream => "stream",
            RecordType::Module => "module",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Ok(RecordType::String),
            "list" => Ok(RecordType::List),
            "set" => Ok(RecordType::Set),
            "zset" | "sortedset" => Ok(RecordType::Zset),
            "hash" => Ok(RecordType::Hash),
            "stream" => Ok(RecordType::Stream),
            "module" => Ok(RecordType::Module),
            other => Err(format!("unknown record type '{}'", other)),
        }
    }
}

/// Parse a comma/space separated type list into a filter set.
pub fn parse_type_set(spec: &str) -> std::result::Result<HashSet<RecordType>, String> {
    spec.split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

/// One record from the upstream decoder or replication client.
#[derive(Debug, Clone)]
pub enum Event {
    /// Snapshot parsing started.
    BeginRdb,
    /// A self-contained key/value record.
    KeyValue {
        /// Source database index.
        db: i64,
        /// Raw key bytes.
        key: Bytes,
        /// Value type tag.
        rtype: RecordType,
        /// Remaining TTL in milliseconds; 0 means no expiry.
        ttl_ms: u64,
        /// `RESTORE`-consumable serialized value, possibly in chunks.
        dump: Vec<Bytes>,
    },
    /// A write command embedded in the snapshot phase.
    Command {
        /// Source database index.
        db: i64,
        /// Command argv as raw byte arrays.
        argv: Vec<Bytes>,
    },
    /// Snapshot parsing finished.
    EndRdb,
    /// A post-snapshot replicated write command.
    StreamCommand {
        /// Command argv as raw byte arrays.
        argv: Vec<Bytes>,
    },
}

/// A pull-style event producer.
///
/// `next` returns `Ok(None)` when the stream is exhausted; the engine then
/// drains and shuts down. Errors from the source abort the run.
pub trait EventSource: Send {
    /// Pull the next event, or `None` at end of stream.
    fn next(&mut self) -> impl Future<Output = Result<Option<Event>>> + Send;
}

/// Adapts a bounded channel into an [`EventSource`] for push-style
/// producers. Dropping the sender ends the stream.
pub struct ChannelSource {
    rx: mpsc::Receiver<Event>,
}

impl ChannelSource {
    /// Create a channel-backed source with the given queue capacity,
    /// returning the producer half alongside it.
    pub fn new(capacity: usize) -> (mpsc::Sender<Event>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

impl EventSource for ChannelSource {
    async fn next(&mut self) -> Result<Option<Event>> {
        Ok(self.rx.recv().await)
    }
}

/// An in-memory source over a fixed event list. Primarily for tests and
/// offline replays.
pub struct VecSource {
    events: std::vec::IntoIter<Event>,
}

impl VecSource {
    /// Wrap a pre-built event list.
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: events.into_iter(),
        }
    }
}

impl EventSource for VecSource {
    async fn next(&mut self) -> Result<Option<Event>> {
        Ok(self.events.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_parse() {
        assert_eq!("string".parse::<RecordType>().unwrap(), RecordType::String);
        assert_eq!("ZSET".parse::<RecordType>().unwrap(), RecordType::Zset);
        assert_eq!(
            "sortedset".parse::<RecordType>().unwrap(),
            RecordType::Zset
        );
        assert!("blob".parse::<RecordType>().is_err());
    }

    #[test]
    fn test_parse_type_set() {
        let set = parse_type_set("string,hash").unwrap();
        assert!(set.contains(&RecordType::String));
        assert!(set.contains(&RecordType::Hash));
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn test_channel_source_ends_on_drop() {
        let (tx, mut source) = ChannelSource::new(4);
        tx.send(Event::BeginRdb).await.unwrap();
        drop(tx);
        assert!(matches!(source.next().await.unwrap(), Some(Event::BeginRdb)));
        assert!(source.next().await.unwrap().is_none());
    }
}
