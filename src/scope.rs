//! Scope selection and the durable directory tree.
//!
//! A scope is the (month, team, hq) triple that names one replicated
//! document. Selection is hierarchical: clearing or changing an upper level
//! invalidates everything below it.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::SyncError;
use crate::record::Record;
use crate::relay::{DurableStore, FIELD_HQ, FIELD_SALES_TEAM, FIELD_STATE, FIELD_TEAMS};
use crate::store::crdt::{ActorId, RecordSet};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Partially selected scope, as held by a session between selections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub month: Option<String>,
    pub team: Option<String>,
    pub hq: Option<String>,
}

impl Scope {
    /// The fully resolved triple, if all three levels are selected.
    pub fn full(&self) -> Option<FullScope> {
        Some(FullScope {
            month: self.month.clone()?,
            team: self.team.clone()?,
            hq: self.hq.clone()?,
        })
    }
}

/// A completely selected scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullScope {
    pub month: String,
    pub team: String,
    pub hq: String,
}

impl FullScope {
    pub fn id(&self) -> ScopeId {
        ScopeId(format!("{}-{}-{}", self.month, self.team, self.hq))
    }

    pub fn month_path(&self) -> String {
        format!("Root/{}", self.month)
    }

    pub fn team_path(&self) -> String {
        format!("Root/{}/{}", self.month, self.team)
    }

    pub fn leaf_path(&self) -> String {
        format!("Root/{}/{}/{}", self.month, self.team, self.hq)
    }
}

/// Flat identifier for a scope, used as mesh room name and cache file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeId(pub String);

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reads and maintains the directory tree in the durable store.
#[derive(Clone)]
pub struct ScopeResolver {
    store: Arc<dyn DurableStore>,
}

impl ScopeResolver {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Teams registered under a month. A month with no document yet simply
    /// has no teams.
    pub async fn list_teams(&self, month: &str) -> Result<Vec<String>, SyncError> {
        let doc = self
            .store
            .read(&format!("Root/{month}"))
            .await
            .map_err(|e| SyncError::DirectoryFetch(e.to_string()))?;
        let mut teams: Vec<String> = doc
            .as_ref()
            .and_then(|d| d.get(FIELD_TEAMS))
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        teams.sort();
        teams.dedup();
        Ok(teams)
    }

    /// HQ documents under a month and team.
    pub async fn list_hqs(&self, month: &str, team: &str) -> Result<Vec<String>, SyncError> {
        let mut hqs = self
            .store
            .list_dir(&format!("Root/{month}/{team}"))
            .await
            .map_err(|e| SyncError::DirectoryFetch(e.to_string()))?;
        hqs.sort();
        Ok(hqs)
    }

    /// Register a team under a month. Idempotent: re-adding an existing team
    /// succeeds without rewriting anything visible. On failure the directory
    /// is left exactly as the durable store last had it.
    pub async fn create_team(&self, month: &str, team: &str) -> Result<(), SyncError> {
        let path = format!("Root/{month}");
        let mut teams = self.list_teams(month).await?;
        if teams.iter().any(|t| t == team) {
            return Ok(());
        }
        teams.push(team.to_string());
        teams.sort();
        let mut fields = Map::new();
        fields.insert(
            FIELD_TEAMS.into(),
            Value::Array(teams.into_iter().map(Value::String).collect()),
        );
        self.store
            .merge_write(&path, fields)
            .await
            .map_err(|e| SyncError::DirectoryUpdate(e.to_string()))
    }

    /// Provision an HQ document with a seed row so it is listable and
    /// distinguishable from an unwritten path. Succeeds only once the
    /// durable store has acknowledged the write. An already-provisioned HQ
    /// is left untouched; its state may hold live edits.
    pub async fn create_hq(&self, month: &str, team: &str, hq: &str) -> Result<(), SyncError> {
        let path = format!("Root/{month}/{team}/{hq}");
        let existing = self
            .store
            .read(&path)
            .await
            .map_err(|e| SyncError::DirectoryFetch(e.to_string()))?;
        if existing
            .as_ref()
            .and_then(|doc| doc.get(FIELD_STATE))
            .is_some()
        {
            return Ok(());
        }

        let mut set = RecordSet::new(ActorId::random());
        set.append(Record::seed(team, hq));

        let mut fields = Map::new();
        fields.insert(FIELD_HQ.into(), Value::String(hq.to_string()));
        fields.insert(FIELD_SALES_TEAM.into(), Value::String(team.to_string()));
        fields.insert(FIELD_STATE.into(), Value::String(BASE64.encode(set.encode())));

        self.store
            .merge_write(&path, fields)
            .await
            .map_err(|e| {
                warn!(path = %path, error = %e, "hq provisioning failed");
                SyncError::DirectoryUpdate(e.to_string())
            })
    }
}
