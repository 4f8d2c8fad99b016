//! Session-scoped configuration and identity.
//!
//! There is deliberately no module-level mutable configuration: every
//! service call receives a [`SessionContext`] whose lifetime is tied to the
//! consumer session that created it.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::crdt::ActorId;
use crate::transport::PeerId;

/// Tunables for the replication machinery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory holding per-scope persistence cache files.
    pub cache_dir: PathBuf,
    /// Interval between peer liveness heartbeats.
    pub heartbeat_interval_ms: u64,
    /// A peer with no heartbeat for this long is dropped from the presence map.
    pub peer_timeout_ms: u64,
    /// Poll interval for durable-store backends without push notifications.
    pub relay_poll_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./ledgersync-cache"),
            heartbeat_interval_ms: 5_000,
            peer_timeout_ms: 15_000,
            relay_poll_ms: 2_000,
        }
    }
}

impl SyncConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn relay_poll_interval(&self) -> Duration {
        Duration::from_millis(self.relay_poll_ms)
    }
}

/// Identity and configuration for one consumer session.
///
/// Init and teardown follow the consumer's authentication lifecycle; the
/// actor and peer ids are fresh per context so two sessions of the same
/// user never collide in the merge engine or the presence map.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub actor: ActorId,
    pub peer: PeerId,
    pub config: SyncConfig,
}

impl SessionContext {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            actor: ActorId::random(),
            peer: PeerId::new_v4(),
            config,
        }
    }
}
