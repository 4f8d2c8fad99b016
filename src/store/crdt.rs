//! Delta-state merge engine for the replicated record sequence.
//!
//! Every element carries a [`Dot`], a Lamport clock paired with the actor
//! that minted it, and the materialized sequence is the live elements in
//! `Dot` order, which totally orders concurrent inserts the same way on
//! every replica without coordination. Deletes are tombstones. A [`Delta`]
//! is any subset of elements and tombstones, and the full document state is
//! itself a delta, so merging is a set union: commutative, associative and
//! idempotent by construction.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::Record;

/// Identifies one replica of a document.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ActorId(pub u64);

impl ActorId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().as_u128() as u64)
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Globally unique element identity. Field order matters: the derived `Ord`
/// sorts by clock first, then actor, which is the replication-wide total
/// order of the sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Dot {
    pub clock: u64,
    pub actor: ActorId,
}

/// One appended record together with its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub dot: Dot,
    pub record: Record,
}

/// An opaque merge unit: new elements and/or new tombstones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub elements: Vec<Element>,
    pub tombstones: Vec<Dot>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.tombstones.is_empty()
    }
}

/// Per-scope replicated record sequence.
pub struct RecordSet {
    actor: ActorId,
    clock: u64,
    elements: BTreeMap<Dot, Record>,
    tombstones: BTreeSet<Dot>,
}

impl RecordSet {
    pub fn new(actor: ActorId) -> Self {
        Self {
            actor,
            clock: 0,
            elements: BTreeMap::new(),
            tombstones: BTreeSet::new(),
        }
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    fn tick(&mut self) -> Dot {
        self.clock += 1;
        Dot {
            clock: self.clock,
            actor: self.actor,
        }
    }

    /// Local insert. Returns the delta to replicate.
    pub fn append(&mut self, record: Record) -> Delta {
        let dot = self.tick();
        self.elements.insert(dot, record.clone());
        Delta {
            elements: vec![Element { dot, record }],
            tombstones: Vec::new(),
        }
    }

    /// Logical delete of the first live record whose `invoice_no` matches.
    /// Deleting an absent or already-deleted key is a no-op (`None`).
    pub fn remove_by_key(&mut self, invoice_no: &str) -> Option<Delta> {
        let dot = self
            .elements
            .iter()
            .find(|(dot, rec)| !self.tombstones.contains(dot) && rec.invoice_no == invoice_no)
            .map(|(dot, _)| *dot)?;
        self.tombstones.insert(dot);
        Some(Delta {
            elements: Vec::new(),
            tombstones: vec![dot],
        })
    }

    /// Merge a remote delta. Returns whether anything new was absorbed;
    /// re-applying a delta is always a no-op.
    pub fn merge(&mut self, delta: &Delta) -> bool {
        let mut changed = false;
        for element in &delta.elements {
            if self.clock < element.dot.clock {
                self.clock = element.dot.clock;
            }
            if !self.elements.contains_key(&element.dot) {
                self.elements.insert(element.dot, element.record.clone());
                changed = true;
            }
        }
        for dot in &delta.tombstones {
            if self.clock < dot.clock {
                self.clock = dot.clock;
            }
            if self.tombstones.insert(*dot) {
                changed = true;
            }
        }
        changed
    }

    /// Live records in the replication-wide total order.
    pub fn records(&self) -> Vec<Record> {
        self.elements
            .iter()
            .filter(|(dot, _)| !self.tombstones.contains(dot))
            .map(|(_, rec)| rec.clone())
            .collect()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.elements
            .keys()
            .filter(|dot| !self.tombstones.contains(dot))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The complete document as a delta, for cold bootstrap and persistence.
    pub fn full_state(&self) -> Delta {
        Delta {
            elements: self
                .elements
                .iter()
                .map(|(dot, record)| Element {
                    dot: *dot,
                    record: record.clone(),
                })
                .collect(),
            tombstones: self.tombstones.iter().copied().collect(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Delta only holds plain data; serialization cannot fail.
        serde_json::to_vec(&self.full_state()).expect("delta serialization")
    }

    pub fn decode(bytes: &[u8]) -> Result<Delta, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(invoice: &str) -> Record {
        Record {
            invoice_no: invoice.to_string(),
            qty: 1.0,
            value: 10.0,
            ..Default::default()
        }
    }

    fn replica(seed: u64) -> RecordSet {
        RecordSet::new(ActorId(seed))
    }

    #[test]
    fn deltas_converge_in_any_order_with_duplicates() {
        let mut a = replica(1);
        let mut b = replica(2);
        let d1 = a.append(rec("INV-1"));
        let d2 = a.append(rec("INV-2"));
        let d3 = b.append(rec("INV-3"));

        let mut x = replica(10);
        let mut y = replica(11);
        for d in [&d1, &d2, &d3] {
            x.merge(d);
        }
        for d in [&d3, &d1, &d2, &d2, &d1] {
            y.merge(d);
        }
        assert_eq!(x.encode(), y.encode());
        assert_eq!(x.records(), y.records());
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = replica(1);
        let delta = a.append(rec("INV-1"));

        let mut b = replica(2);
        assert!(b.merge(&delta));
        let once = b.encode();
        assert!(!b.merge(&delta));
        assert_eq!(b.encode(), once);
    }

    #[test]
    fn concurrent_appends_order_deterministically() {
        // Same Lamport clock on both sides: actor id breaks the tie.
        let mut a = replica(2);
        let mut b = replica(1);
        let da = a.append(rec("from-a"));
        let db = b.append(rec("from-b"));

        a.merge(&db);
        b.merge(&da);
        let order_a: Vec<_> = a.records().into_iter().map(|r| r.invoice_no).collect();
        let order_b: Vec<_> = b.records().into_iter().map(|r| r.invoice_no).collect();
        assert_eq!(order_a, order_b);
        assert_eq!(order_a, vec!["from-b", "from-a"]);
    }

    #[test]
    fn delete_is_idempotent_and_independent_of_appends() {
        let mut a = replica(1);
        let mut b = replica(2);
        let insert = a.append(rec("INV-1"));
        b.merge(&insert);

        // Concurrent: a deletes INV-1 while b appends INV-2.
        let del = a.remove_by_key("INV-1").unwrap();
        let add = b.append(rec("INV-2"));

        a.merge(&add);
        b.merge(&del);
        b.merge(&del);
        assert_eq!(a.records(), b.records());
        assert_eq!(a.len(), 1);
        assert_eq!(a.records()[0].invoice_no, "INV-2");

        // Deleting an already-deleted key is a no-op.
        assert!(a.remove_by_key("INV-1").is_none());
        assert!(a.remove_by_key("no-such-key").is_none());
    }

    #[test]
    fn clock_advances_past_merged_dots() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.append(rec("INV-1"));
        a.append(rec("INV-2"));
        b.merge(&a.full_state());

        // b's next append must sort after everything it has seen.
        b.append(rec("INV-3"));
        let order: Vec<_> = b.records().into_iter().map(|r| r.invoice_no).collect();
        assert_eq!(order, vec!["INV-1", "INV-2", "INV-3"]);
    }

    #[test]
    fn full_state_roundtrips_through_encode() {
        let mut a = replica(1);
        a.append(rec("INV-1"));
        a.append(rec("INV-2"));
        a.remove_by_key("INV-1");

        let bytes = a.encode();
        let delta = RecordSet::decode(&bytes).unwrap();
        let mut b = replica(2);
        b.merge(&delta);
        assert_eq!(a.records(), b.records());
    }
}
