//! Change notifications with explicit provenance.
//!
//! Every update entering or leaving the document store is wrapped in a
//! [`DeltaEnvelope`] whose origin tag travels with it end-to-end. Loop
//! prevention between the two replication channels branches on this tag and
//! never on an inferred heuristic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const FEED_CAPACITY: usize = 256;

/// Which channel produced an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Local,
    Peer,
    CloudRelay,
}

/// An opaque merge delta plus the provenance needed to route it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaEnvelope {
    pub payload: Vec<u8>,
    pub origin: Origin,
    pub timestamp: DateTime<Utc>,
}

impl DeltaEnvelope {
    pub fn new(payload: Vec<u8>, origin: Origin) -> Self {
        Self {
            payload,
            origin,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast feed of applied changes, fanned out to the persistence cache,
/// the peer transport and the cloud relay.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<DeltaEnvelope>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeltaEnvelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, envelope: DeltaEnvelope) {
        let _ = self.tx.send(envelope);
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}
