//! Slot-to-endpoint routing.
//!
//! A [`SlotRouter`] is built once from a parsed cluster description and
//! shared read-only across workers. Every slot in `[0, 16384)` must be
//! owned by exactly one master; gaps and overlaps are configuration errors,
//! as is (in strict mode) a slot caught mid-migration.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::cluster::nodes::ClusterNode;
use crate::cluster::slots::{slot_of, CLUSTER_SLOTS};
use crate::error::{Error, Result};

/// Immutable total mapping `slot → owner address`.
pub struct SlotRouter {
    /// Index into `addrs`, one entry per slot.
    owners: Vec<u16>,
    /// Master addresses, deduplicated, in first-seen order.
    addrs: Vec<Arc<str>>,
}

impl SlotRouter {
    /// Build a router from node records.
    ///
    /// Only usable masters participate. In strict mode a node with
    /// migrating/importing slots is rejected.
    pub fn build(nodes: &[ClusterNode], strict: bool) -> Result<Self> {
        let mut addrs: Vec<Arc<str>> = Vec::new();
        let mut owners: Vec<Option<u16>> = vec![None; CLUSTER_SLOTS as usize];

        for node in nodes.iter().filter(|n| n.is_master()) {
            if node.unstable {
                if strict {
                    return Err(Error::Config(format!(
                        "node {} ({}) has slots in migration",
                        node.id,
                        node.addr()
                    )));
                }
                tracing::warn!(
                    node = %node.id,
                    addr = %node.addr(),
                    "node has slots in migration; routing by current ownership"
                );
            }
            if node.slots.is_empty() {
                continue;
            }
            let addr: Arc<str> = node.addr().into();
            let idx = match addrs.iter().position(|a| *a == addr) {
                Some(i) => i as u16,
                None => {
                    addrs.push(addr);
                    (addrs.len() - 1) as u16
                }
            };
            for range in &node.slots {
                for slot in range.start..=range.end {
                    if let Some(prev) = owners[slot as usize] {
                        if prev != idx {
                            return Err(Error::Config(format!(
                                "slot {} owned by both {} and {}",
                                slot,
                                addrs[prev as usize],
                                addrs[idx as usize]
                            )));
                        }
                    }
                    owners[slot as usize] = Some(idx);
                }
            }
        }

        let owners = owners
            .into_iter()
            .enumerate()
            .map(|(slot, owner)| {
                owner.ok_or_else(|| Error::Config(format!("slot {} is unassigned", slot)))
            })
            .collect::<Result<Vec<u16>>>()?;

        Ok(Self { owners, addrs })
    }

    /// All master addresses participating in the mapping.
    pub fn addrs(&self) -> &[Arc<str>] {
        &self.addrs
    }

    /// The owner of a slot.
    pub fn owner_of_slot(&self, slot: u16) -> &Arc<str> {
        &self.addrs[self.owners[slot as usize] as usize]
    }

    /// The slot and owning endpoint for a key.
    pub fn owner(&self, key: &[u8]) -> (u16, &Arc<str>) {
        let slot = slot_of(key);
        (slot, self.owner_of_slot(slot))
    }

    /// The slots each owner address holds, for seeding endpoint state.
    pub fn slot_assignments(&self) -> HashMap<Arc<str>, Vec<u16>> {
        let mut assignments: HashMap<Arc<str>, Vec<u16>> = HashMap::new();
        for (slot, owner) in self.owners.iter().enumerate() {
            assignments
                .entry(self.addrs[*owner as usize].clone())
                .or_default()
                .push(slot as u16);
        }
        assignments
    }

    /// The common slot of a multi-key command, or `None` when the keys span
    /// slots (the caller must drop the command in cluster mode).
    pub fn same_slot(&self, keys: &[Bytes]) -> Option<u16> {
        let mut keys = keys.iter();
        let first = slot_of(keys.next()?);
        for key in keys {
            if slot_of(key) != first {
                return None;
            }
        }
        Some(first)
    }
}

impl std::fmt::Debug for SlotRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRouter")
            .field("masters", &self.addrs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::nodes::parse_nodes;

    fn three_masters() -> Vec<ClusterNode> {
        parse_nodes(
            "\
a 10.0.0.1:7000@17000 master - 0 0 1 connected 0-5460
b 10.0.0.2:7000@17000 master - 0 0 2 connected 5461-10922
c 10.0.0.3:7000@17000 master - 0 0 3 connected 10923-16383
r 10.0.0.4:7000@17000 slave a 0 0 1 connected
",
        )
        .unwrap()
    }

    #[test]
    fn test_build_total_coverage() {
        let router = SlotRouter::build(&three_masters(), true).unwrap();
        assert_eq!(router.addrs().len(), 3);
        assert_eq!(router.owner_of_slot(0).as_ref(), "10.0.0.1:7000");
        assert_eq!(router.owner_of_slot(5461).as_ref(), "10.0.0.2:7000");
        assert_eq!(router.owner_of_slot(16383).as_ref(), "10.0.0.3:7000");
    }

    #[test]
    fn test_hash_tag_keys_share_owner() {
        let router = SlotRouter::build(&three_masters(), true).unwrap();
        // {u} hashes to slot 5474 → second master.
        let (slot_a, owner_a) = router.owner(b"{u}:a");
        let (slot_b, owner_b) = router.owner(b"{u}:b");
        assert_eq!(slot_a, slot_b);
        assert_eq!(owner_a.as_ref(), "10.0.0.2:7000");
        assert_eq!(owner_a, owner_b);
    }

    #[test]
    fn test_gap_is_config_error() {
        let nodes = parse_nodes(
            "\
a 10.0.0.1:7000 master - 0 0 1 connected 0-5460
b 10.0.0.2:7000 master - 0 0 2 connected 5462-16383
",
        )
        .unwrap();
        let err = SlotRouter::build(&nodes, true).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("5461"));
    }

    #[test]
    fn test_overlap_is_config_error() {
        let nodes = parse_nodes(
            "\
a 10.0.0.1:7000 master - 0 0 1 connected 0-5461
b 10.0.0.2:7000 master - 0 0 2 connected 5461-16383
",
        )
        .unwrap();
        assert!(matches!(
            SlotRouter::build(&nodes, true),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_strict_rejects_unstable() {
        let nodes = parse_nodes(
            "\
a 10.0.0.1:7000 master - 0 0 1 connected 0-5460 [5461->-b]
b 10.0.0.2:7000 master - 0 0 2 connected 5461-16383
",
        )
        .unwrap();
        assert!(matches!(
            SlotRouter::build(&nodes, true),
            Err(Error::Config(_))
        ));
        // Non-strict tolerates it as long as coverage is total.
        assert!(SlotRouter::build(&nodes, false).is_ok());
    }

    #[test]
    fn test_slot_assignments_partition_the_space() {
        let router = SlotRouter::build(&three_masters(), true).unwrap();
        let assignments = router.slot_assignments();
        assert_eq!(assignments.len(), 3);
        let total: usize = assignments.values().map(Vec::len).sum();
        assert_eq!(total, crate::cluster::CLUSTER_SLOTS as usize);
        let first = &assignments[&Arc::from("10.0.0.1:7000")];
        assert_eq!(first.len(), 5461);
        assert_eq!(first[0], 0);
        assert_eq!(*first.last().unwrap(), 5460);
    }

    #[test]
    fn test_same_slot() {
        let router = SlotRouter::build(&three_masters(), true).unwrap();
        let same = vec![Bytes::from("{u}:a"), Bytes::from("{u}:b")];
        assert_eq!(router.same_slot(&same), Some(crate::cluster::slot_of(b"u")));

        let cross = vec![Bytes::from("a"), Bytes::from("b")];
        assert_eq!(router.same_slot(&cross), None);

        assert_eq!(router.same_slot(&[]), None);
    }
}
