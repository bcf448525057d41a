//! Event filtering: databases, value types, key patterns.

use std::collections::HashSet;

use regex::bytes::Regex;

use crate::error::{Error, Result};
use crate::event::RecordType;

/// Predicate set applied to every upstream event.
///
/// An event passes iff each configured predicate admits it: db membership,
/// type membership, and any-regex key match. Unset predicates admit
/// everything. Key patterns use `regex::bytes` — keys are not required to
/// be UTF-8.
#[derive(Debug, Default, Clone)]
pub struct FilterSet {
    dbs: Option<HashSet<i64>>,
    types: Option<HashSet<RecordType>>,
    key_patterns: Option<Vec<Regex>>,
}

impl FilterSet {
    /// The empty filter: admits every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given source databases.
    pub fn with_dbs(mut self, dbs: impl IntoIterator<Item = i64>) -> Self {
        self.dbs = Some(dbs.into_iter().collect());
        self
    }

    /// Restrict to the given value types.
    pub fn with_types(mut self, types: impl IntoIterator<Item = RecordType>) -> Self {
        self.types = Some(types.into_iter().collect());
        self
    }

    /// Restrict keys to those matching at least one of the patterns.
    pub fn with_key_patterns<I, S>(mut self, patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compiled = patterns
            .into_iter()
            .map(|p| {
                Regex::new(p.as_ref())
                    .map_err(|e| Error::Config(format!("bad key pattern '{}': {}", p.as_ref(), e)))
            })
            .collect::<Result<Vec<_>>>()?;
        self.key_patterns = Some(compiled);
        Ok(self)
    }

    /// Whether any predicate is configured.
    pub fn is_empty(&self) -> bool {
        self.dbs.is_none() && self.types.is_none() && self.key_patterns.is_none()
    }

    /// Does a key/value record pass?
    pub fn admits_key_value(&self, db: i64, rtype: RecordType, key: &[u8]) -> bool {
        self.admits_db(db) && self.admits_type(rtype) && self.admits_key(key)
    }

    /// Does a replicated command touching `key` (if any) pass?
    /// Type predicates do not apply to commands.
    pub fn admits_command(&self, db: i64, key: Option<&[u8]>) -> bool {
        self.admits_db(db) && key.map_or(true, |k| self.admits_key(k))
    }

    fn admits_db(&self, db: i64) -> bool {
        self.dbs.as_ref().map_or(true, |set| set.contains(&db))
    }

    fn admits_type(&self, rtype: RecordType) -> bool {
        self.types.as_ref().map_or(true, |set| set.contains(&rtype))
    }

    fn admits_key(&self, key: &[u8]) -> bool {
        self.key_patterns
            .as_ref()
            .map_or(true, |pats| pats.iter().any(|p| p.is_match(key)))
    }
}
