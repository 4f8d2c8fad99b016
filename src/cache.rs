//! On-disk persistence cache.
//!
//! One file per scope, holding the last known full document state framed
//! with a magic prefix and a CRC32 trailer. The cache is an availability
//! layer only: a missing or corrupt file means a cold bootstrap from the
//! relay, never an error surfaced to the session.

use std::path::{Path, PathBuf};

use bytes::BufMut;
use crc32fast::Hasher;
use tracing::warn;

use crate::scope::ScopeId;

const MAGIC: &[u8; 8] = b"LSYNC01\0";

pub struct PersistenceCache {
    path: PathBuf,
}

impl PersistenceCache {
    /// Opens the cache file for a scope, creating the cache directory if
    /// needed. Never fails; an unwritable directory just makes every
    /// persist a logged no-op.
    pub fn open(cache_dir: &Path, scope: &ScopeId) -> Self {
        if let Err(e) = std::fs::create_dir_all(cache_dir) {
            warn!(dir = %cache_dir.display(), error = %e, "cache directory unavailable");
        }
        Self {
            path: cache_dir.join(format!("{scope}.bin")),
        }
    }

    /// The persisted state, or `None` when the file is absent, truncated or
    /// fails its checksum.
    pub fn load(&self) -> Option<Vec<u8>> {
        let data = std::fs::read(&self.path).ok()?;
        if data.len() < MAGIC.len() + 4 || &data[..MAGIC.len()] != MAGIC {
            warn!(path = %self.path.display(), "cache file has bad framing, ignoring");
            return None;
        }
        let payload = &data[MAGIC.len()..data.len() - 4];
        let stored = u32::from_be_bytes(data[data.len() - 4..].try_into().ok()?);
        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != stored {
            warn!(path = %self.path.display(), "cache file failed checksum, ignoring");
            return None;
        }
        Some(payload.to_vec())
    }

    /// Persist the full state. Failures are logged and swallowed; the next
    /// change will try again.
    pub async fn persist(&self, state: &[u8]) {
        let mut hasher = Hasher::new();
        hasher.update(state);
        let mut buf = Vec::with_capacity(MAGIC.len() + state.len() + 4);
        buf.put_slice(MAGIC);
        buf.put_slice(state);
        buf.put_u32(hasher.finalize());

        if let Err(e) = tokio::fs::write(&self.path, buf).await {
            warn!(path = %self.path.display(), error = %e, "cache persist failed");
        }
    }
}
