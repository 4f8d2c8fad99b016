//! The per-scope document store.
//!
//! [`RecordStore`] wraps the merge engine with the two observation channels
//! the rest of the engine hangs off: a watch channel carrying the current
//! materialized record list, and a [`ChangeFeed`] broadcasting every applied
//! change with its origin tag.

pub mod crdt;

use tokio::sync::{broadcast, watch};

use crate::error::SyncError;
use crate::events::{ChangeFeed, DeltaEnvelope, Origin};
use crate::record::Record;

use self::crdt::{ActorId, RecordSet};

pub struct RecordStore {
    set: RecordSet,
    records_tx: watch::Sender<Vec<Record>>,
    feed: ChangeFeed,
}

impl RecordStore {
    pub fn new(actor: ActorId) -> Self {
        let (records_tx, _) = watch::channel(Vec::new());
        Self {
            set: RecordSet::new(actor),
            records_tx,
            feed: ChangeFeed::new(),
        }
    }

    pub fn actor(&self) -> ActorId {
        self.set.actor()
    }

    /// Load previously persisted state without notifying replication
    /// channels. Used for cache warm starts before any channel is attached.
    pub fn seed(&mut self, bytes: &[u8]) -> Result<(), SyncError> {
        let delta = RecordSet::decode(bytes)?;
        if self.set.merge(&delta) {
            self.records_tx.send_replace(self.set.records());
        }
        Ok(())
    }

    /// Local append. Publishes a `Local` envelope carrying the delta.
    pub fn append(&mut self, record: Record) {
        let delta = self.set.append(record);
        self.records_tx.send_replace(self.set.records());
        let payload = serde_json::to_vec(&delta).expect("delta serialization");
        self.feed.publish(DeltaEnvelope::new(payload, Origin::Local));
    }

    /// Logical delete by invoice number. Returns `false` when no live record
    /// matched, in which case nothing is published.
    pub fn remove_by_key(&mut self, invoice_no: &str) -> bool {
        let Some(delta) = self.set.remove_by_key(invoice_no) else {
            return false;
        };
        self.records_tx.send_replace(self.set.records());
        let payload = serde_json::to_vec(&delta).expect("delta serialization");
        self.feed.publish(DeltaEnvelope::new(payload, Origin::Local));
        true
    }

    /// Apply an update arriving from a replication channel. The envelope is
    /// re-published (origin preserved) only when it changed the document, so
    /// echoes of our own state die here instead of looping.
    pub fn apply_remote(&mut self, envelope: &DeltaEnvelope) -> Result<bool, SyncError> {
        let delta = RecordSet::decode(&envelope.payload)?;
        if !self.set.merge(&delta) {
            return Ok(false);
        }
        self.records_tx.send_replace(self.set.records());
        self.feed.publish(envelope.clone());
        Ok(true)
    }

    /// The complete document encoded for persistence or cold bootstrap.
    pub fn encode_full_state(&self) -> Vec<u8> {
        self.set.encode()
    }

    pub fn records(&self) -> Vec<Record> {
        self.set.records()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn observe(&self) -> watch::Receiver<Vec<Record>> {
        self.records_tx.subscribe()
    }

    pub fn changes(&self) -> broadcast::Receiver<DeltaEnvelope> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(invoice: &str) -> Record {
        Record {
            invoice_no: invoice.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn append_publishes_local_envelope_and_updates_watch() {
        let mut store = RecordStore::new(ActorId(1));
        let mut changes = store.changes();
        let records = store.observe();

        store.append(rec("INV-1"));

        let env = changes.recv().await.unwrap();
        assert_eq!(env.origin, Origin::Local);
        assert_eq!(records.borrow().len(), 1);
        assert_eq!(records.borrow()[0].invoice_no, "INV-1");
    }

    #[tokio::test]
    async fn remote_echo_of_own_state_is_not_republished() {
        let mut store = RecordStore::new(ActorId(1));
        store.append(rec("INV-1"));

        let echo = DeltaEnvelope::new(store.encode_full_state(), Origin::CloudRelay);
        let mut changes = store.changes();
        assert!(!store.apply_remote(&echo).unwrap());
        assert!(matches!(
            changes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn remote_change_is_republished_with_origin_preserved() {
        let mut a = RecordStore::new(ActorId(1));
        a.append(rec("INV-1"));

        let mut b = RecordStore::new(ActorId(2));
        let mut changes = b.changes();
        let env = DeltaEnvelope::new(a.encode_full_state(), Origin::Peer);
        assert!(b.apply_remote(&env).unwrap());

        let seen = changes.recv().await.unwrap();
        assert_eq!(seen.origin, Origin::Peer);
        assert_eq!(b.records()[0].invoice_no, "INV-1");
    }

    #[test]
    fn seed_stays_silent_on_the_change_feed() {
        let mut a = RecordStore::new(ActorId(1));
        a.append(rec("INV-1"));
        let bytes = a.encode_full_state();

        let mut b = RecordStore::new(ActorId(2));
        let mut changes = b.changes();
        b.seed(&bytes).unwrap();
        assert_eq!(b.records().len(), 1);
        assert!(matches!(
            changes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn delete_of_unknown_key_publishes_nothing() {
        let mut store = RecordStore::new(ActorId(1));
        let mut changes = store.changes();
        assert!(!store.remove_by_key("INV-404"));
        assert!(matches!(
            changes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
