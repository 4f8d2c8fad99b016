//! Error taxonomy for the sync engine.
//!
//! Every error here is recoverable: failures are caught at the
//! async boundary that produced them, logged, and the session continues.
//! None of these terminate a session.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The (month, team, hq) triple is not fully selected. This is a valid
    /// inert state for the session, but mutations require a resolved scope.
    #[error("scope is not fully resolved")]
    ScopeIncomplete,

    /// Listing teams or HQs from the durable store failed. The caller keeps
    /// its stale (or empty) listing and retries on the next resolution.
    #[error("directory fetch failed: {0}")]
    DirectoryFetch(String),

    /// Creating or updating directory metadata failed. Local state is left
    /// unchanged so the directory never diverges optimistically.
    #[error("directory update failed: {0}")]
    DirectoryUpdate(String),

    /// Durably persisting document state failed. The in-memory document
    /// stays authoritative; the write is retried with the next change.
    #[error("relay write failed: {0}")]
    RelayWrite(String),

    /// An inbound durable snapshot could not be decoded. The update is
    /// dropped and the session continues.
    #[error("unreadable relay snapshot: {0}")]
    RelaySnapshot(String),

    /// Peer mesh failure. Connectivity status reverts to Connecting;
    /// correctness is unaffected since relay and cache stay authoritative.
    #[error("peer transport failure: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
