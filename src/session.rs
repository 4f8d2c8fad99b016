//! Session lifecycle and scope orchestration.
//!
//! A [`SessionController`] owns one consumer's scope selection and, once the
//! (month, team, hq) triple is complete, the activated replication stack for
//! that scope: record store, persistence cache, mesh room membership and
//! cloud relay. Changing any selection level tears the stack down and
//! invalidates in-flight async work through a generation counter, so a slow
//! directory fetch or bootstrap for an abandoned scope can never leak into
//! the next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cache::PersistenceCache;
use crate::config::SessionContext;
use crate::error::SyncError;
use crate::events::{DeltaEnvelope, Origin};
use crate::record::Record;
use crate::relay::{CloudRelay, DurableStore};
use crate::scope::{FullScope, Scope, ScopeResolver};
use crate::store::RecordStore;
use crate::transport::{ConnectionStatus, MeshConn, MeshHub, MeshSender};

/// What the consumer should be shown right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    SelectMonth,
    SelectTeam,
    SelectHq,
    Connecting,
    Online,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelectMonth => f.write_str("Select Month"),
            Self::SelectTeam => f.write_str("Select Team"),
            Self::SelectHq => f.write_str("Select HQ"),
            Self::Connecting => f.write_str("Connecting"),
            Self::Online => f.write_str("Online"),
        }
    }
}

/// Point-in-time view of the session for rendering.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub records: Vec<Record>,
    pub available_teams: Vec<String>,
    pub available_hqs: Vec<String>,
    pub scope: Scope,
    pub status: SessionStatus,
    pub peer_count: usize,
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    ctx: SessionContext,
    durable: Arc<dyn DurableStore>,
    hub: Arc<MeshHub>,
    resolver: ScopeResolver,
    // Arc so replication tasks can observe staleness without holding a
    // reference cycle back to the session.
    generation: Arc<AtomicU64>,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    scope: Scope,
    available_teams: Vec<String>,
    available_hqs: Vec<String>,
    active: Option<ActiveScope>,
}

struct ActiveScope {
    store: Arc<Mutex<RecordStore>>,
    records_rx: watch::Receiver<Vec<Record>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    peers_rx: watch::Receiver<usize>,
    // Dropping the mesh connection announces departure from the room.
    _mesh: MeshConn,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for ActiveScope {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl SessionController {
    pub fn new(ctx: SessionContext, durable: Arc<dyn DurableStore>, hub: Arc<MeshHub>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                resolver: ScopeResolver::new(durable.clone()),
                ctx,
                durable,
                hub,
                generation: Arc::new(AtomicU64::new(0)),
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Select (or clear) the month. Invalidates team and HQ selections and
    /// tears down any active scope.
    pub async fn set_month(&self, month: Option<String>) -> Result<(), SyncError> {
        let gen = self.bump();
        {
            let mut st = self.inner.state.lock();
            st.scope = Scope {
                month: month.clone(),
                team: None,
                hq: None,
            };
            st.available_teams.clear();
            st.available_hqs.clear();
            st.active = None;
        }
        if let Some(month) = month {
            let teams = self.inner.resolver.list_teams(&month).await?;
            if self.inner.generation.load(Ordering::SeqCst) == gen {
                self.inner.state.lock().available_teams = teams;
            }
        }
        Ok(())
    }

    /// Select (or clear) the team within the current month.
    pub async fn set_team(&self, team: Option<String>) -> Result<(), SyncError> {
        let gen = self.bump();
        let month = {
            let mut st = self.inner.state.lock();
            let Some(month) = st.scope.month.clone() else {
                return Err(SyncError::ScopeIncomplete);
            };
            st.scope.team = team.clone();
            st.scope.hq = None;
            st.available_hqs.clear();
            st.active = None;
            month
        };
        if let Some(team) = team {
            let hqs = self.inner.resolver.list_hqs(&month, &team).await?;
            if self.inner.generation.load(Ordering::SeqCst) == gen {
                self.inner.state.lock().available_hqs = hqs;
            }
        }
        Ok(())
    }

    /// Select (or clear) the HQ. Completing the triple activates the scope.
    pub async fn set_hq(&self, hq: Option<String>) -> Result<(), SyncError> {
        let gen = self.bump();
        let full = {
            let mut st = self.inner.state.lock();
            if st.scope.month.is_none() || st.scope.team.is_none() {
                return Err(SyncError::ScopeIncomplete);
            }
            st.scope.hq = hq;
            st.active = None;
            st.scope.full()
        };
        if let Some(full) = full {
            self.activate(gen, full).await?;
        }
        Ok(())
    }

    /// Register a new team under the selected month and refresh the listing.
    pub async fn create_team(&self, team: &str) -> Result<(), SyncError> {
        let month = self
            .inner
            .state
            .lock()
            .scope
            .month
            .clone()
            .ok_or(SyncError::ScopeIncomplete)?;
        let gen = self.inner.generation.load(Ordering::SeqCst);
        self.inner.resolver.create_team(&month, team).await?;
        let teams = self.inner.resolver.list_teams(&month).await?;
        if self.inner.generation.load(Ordering::SeqCst) == gen {
            self.inner.state.lock().available_teams = teams;
        }
        Ok(())
    }

    /// Provision a new HQ under the selected month and team.
    pub async fn create_hq(&self, hq: &str) -> Result<(), SyncError> {
        let (month, team) = {
            let st = self.inner.state.lock();
            match (&st.scope.month, &st.scope.team) {
                (Some(m), Some(t)) => (m.clone(), t.clone()),
                _ => return Err(SyncError::ScopeIncomplete),
            }
        };
        let gen = self.inner.generation.load(Ordering::SeqCst);
        self.inner.resolver.create_hq(&month, &team, hq).await?;
        let hqs = self.inner.resolver.list_hqs(&month, &team).await?;
        if self.inner.generation.load(Ordering::SeqCst) == gen {
            self.inner.state.lock().available_hqs = hqs;
        }
        Ok(())
    }

    /// Append a record to the active scope's document. The scope's team and
    /// HQ are stamped onto the record when the caller left them blank.
    pub fn add_record(&self, mut record: Record) -> Result<(), SyncError> {
        let st = self.inner.state.lock();
        let active = st.active.as_ref().ok_or(SyncError::ScopeIncomplete)?;
        let full = st.scope.full().ok_or(SyncError::ScopeIncomplete)?;
        if record.sales_team.is_empty() {
            record.sales_team = full.team;
        }
        if record.hq.is_empty() {
            record.hq = full.hq;
        }
        active.store.lock().append(record);
        Ok(())
    }

    /// Logically delete the record with the given invoice number. `false`
    /// when no live record matched.
    pub fn delete_record(&self, invoice_no: &str) -> Result<bool, SyncError> {
        let st = self.inner.state.lock();
        let active = st.active.as_ref().ok_or(SyncError::ScopeIncomplete)?;
        let removed = active.store.lock().remove_by_key(invoice_no);
        Ok(removed)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let st = self.inner.state.lock();
        let scope = st.scope.clone();
        let (records, peer_count, conn) = match &st.active {
            Some(a) => (
                a.records_rx.borrow().clone(),
                *a.peers_rx.borrow(),
                Some(*a.status_rx.borrow()),
            ),
            None => (Vec::new(), 0, None),
        };
        let status = if scope.month.is_none() {
            SessionStatus::SelectMonth
        } else if scope.team.is_none() {
            SessionStatus::SelectTeam
        } else if scope.hq.is_none() {
            SessionStatus::SelectHq
        } else {
            match conn {
                Some(ConnectionStatus::Online) => SessionStatus::Online,
                _ => SessionStatus::Connecting,
            }
        };
        SessionSnapshot {
            records,
            available_teams: st.available_teams.clone(),
            available_hqs: st.available_hqs.clone(),
            scope,
            status,
            peer_count,
        }
    }

    /// Tear everything down and return to the unselected state. Safe to
    /// call at any point in the lifecycle, including while inactive.
    pub fn stop(&self) {
        self.bump();
        let mut st = self.inner.state.lock();
        st.active = None;
        st.scope = Scope::default();
        st.available_teams.clear();
        st.available_hqs.clear();
    }

    fn bump(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn activate(&self, gen: u64, full: FullScope) -> Result<(), SyncError> {
        let scope_id = full.id();
        let cache = Arc::new(PersistenceCache::open(
            &self.inner.ctx.config.cache_dir,
            &scope_id,
        ));

        let mut store = RecordStore::new(self.inner.ctx.actor);
        if let Some(bytes) = cache.load() {
            if let Err(e) = store.seed(&bytes) {
                warn!(scope = %scope_id, error = %e, "discarding undecodable cache state");
            }
        }
        // Subscribe before any replication task can publish.
        let changes_rx = store.changes();
        let records_rx = store.observe();
        let store = Arc::new(Mutex::new(store));

        let mut mesh = self
            .inner
            .hub
            .join(&scope_id.0, self.inner.ctx.peer, &self.inner.ctx.config);
        let status_rx = mesh.status();
        let peers_rx = mesh.peers();
        let sender = mesh.sender();
        let peer_deltas = mesh
            .take_deltas()
            .ok_or_else(|| SyncError::Transport("delta queue already taken".into()))?;

        let relay = Arc::new(CloudRelay::new(self.inner.durable.clone(), full));
        // Subscribing before the bootstrap read so an update racing the
        // bootstrap is not lost.
        let notifications = relay.subscribe();

        let tasks = vec![
            tokio::spawn(pump_changes(
                self.inner.generation.clone(),
                gen,
                changes_rx,
                store.clone(),
                cache,
                sender,
                relay.clone(),
            )),
            tokio::spawn(run_relay(
                self.inner.generation.clone(),
                gen,
                relay,
                store.clone(),
                notifications,
            )),
            tokio::spawn(pump_peer_deltas(
                self.inner.generation.clone(),
                gen,
                peer_deltas,
                store.clone(),
            )),
        ];

        let active = ActiveScope {
            store,
            records_rx,
            status_rx,
            peers_rx,
            _mesh: mesh,
            tasks,
        };

        let mut st = self.inner.state.lock();
        if self.inner.generation.load(Ordering::SeqCst) == gen {
            st.active = Some(active);
        }
        // A stale generation drops the stack on the floor here, aborting
        // its tasks and leaving the room.
        Ok(())
    }
}

/// Fans every applied change out to the cache, the mesh and the relay,
/// branching strictly on the envelope's origin tag.
async fn pump_changes(
    generation: Arc<AtomicU64>,
    gen: u64,
    mut changes: broadcast::Receiver<DeltaEnvelope>,
    store: Arc<Mutex<RecordStore>>,
    cache: Arc<PersistenceCache>,
    sender: MeshSender,
    relay: Arc<CloudRelay>,
) {
    loop {
        let env = match changes.recv().await {
            Ok(env) => env,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "change feed lagged, resyncing from full state");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if generation.load(Ordering::SeqCst) != gen {
            break;
        }
        let state = store.lock().encode_full_state();
        cache.persist(&state).await;

        if env.origin == Origin::Local {
            if let Err(e) = sender.send_delta(env.payload.clone()) {
                warn!(error = %e, "mesh delivery failed");
            }
        }
        // Updates that came FROM the relay never go back to it; everything
        // else does, as the full current state, so one failed write is
        // repaired by the next.
        if env.origin != Origin::CloudRelay && !relay.is_bootstrapping() {
            if let Err(e) = relay.write_back(&state).await {
                warn!(error = %e, "relay write failed, retrying with next change");
            }
        }
    }
}

/// Bootstraps from the durable snapshot, then applies pushed updates.
async fn run_relay(
    generation: Arc<AtomicU64>,
    gen: u64,
    relay: Arc<CloudRelay>,
    store: Arc<Mutex<RecordStore>>,
    mut notifications: broadcast::Receiver<Value>,
) {
    match relay.bootstrap().await {
        Ok(Some(env)) => {
            if generation.load(Ordering::SeqCst) == gen {
                if let Err(e) = store.lock().apply_remote(&env) {
                    warn!(error = %e, "dropping undecodable bootstrap state");
                }
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "relay bootstrap failed, starting from cache"),
    }
    relay.finish_bootstrap();

    // Offline edits from a previous session may never have reached the
    // relay; reconcile them now that the bootstrap state is merged in.
    let state = {
        let s = store.lock();
        if s.is_empty() {
            None
        } else {
            Some(s.encode_full_state())
        }
    };
    if let Some(state) = state {
        if generation.load(Ordering::SeqCst) == gen {
            if let Err(e) = relay.write_back(&state).await {
                warn!(error = %e, "post-bootstrap reconciliation write failed");
            }
        }
    }

    loop {
        let doc = match notifications.recv().await {
            Ok(doc) => doc,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "relay notifications lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if generation.load(Ordering::SeqCst) != gen {
            break;
        }
        match relay.decode_notification(&doc) {
            Ok(Some(env)) => {
                let applied = store.lock().apply_remote(&env);
                if let Err(e) = applied {
                    warn!(error = %e, "dropping undecodable relay update");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "dropping unreadable relay update"),
        }
    }
}

/// Applies deltas received from mesh peers.
async fn pump_peer_deltas(
    generation: Arc<AtomicU64>,
    gen: u64,
    mut deltas: mpsc::Receiver<Vec<u8>>,
    store: Arc<Mutex<RecordStore>>,
) {
    while let Some(payload) = deltas.recv().await {
        if generation.load(Ordering::SeqCst) != gen {
            break;
        }
        let env = DeltaEnvelope::new(payload, Origin::Peer);
        let applied = store.lock().apply_remote(&env);
        if let Err(e) = applied {
            warn!(error = %e, "dropping undecodable peer delta");
        }
    }
}
