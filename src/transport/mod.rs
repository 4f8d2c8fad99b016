//! Best-effort peer mesh.
//!
//! Peers sharing a scope meet in a named room and exchange deltas plus
//! liveness heartbeats. The mesh only accelerates convergence; the cloud
//! relay remains the authoritative channel, so any mesh failure degrades
//! latency, never correctness.
//!
//! [`MeshHub`] is the rendezvous seam: the in-process implementation wires
//! rooms up with broadcast channels, which is also exactly what the
//! integration tests need to host several sessions in one process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::SyncError;

pub type PeerId = Uuid;

const ROOM_CAPACITY: usize = 256;
const DELTA_QUEUE: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub from: PeerId,
    pub body: PeerMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    Join,
    Heartbeat,
    Leave,
    Delta { payload: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Online,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => f.write_str("Connecting"),
            Self::Online => f.write_str("Online"),
        }
    }
}

/// Room registry. One hub per process; sessions joining the same room see
/// each other's traffic.
pub struct MeshHub {
    rooms: Mutex<HashMap<String, broadcast::Sender<WireMessage>>>,
}

impl MeshHub {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Number of rooms with at least one live member.
    pub fn active_rooms(&self) -> usize {
        self.rooms
            .lock()
            .values()
            .filter(|tx| tx.receiver_count() > 0)
            .count()
    }

    fn room(&self, name: &str) -> broadcast::Sender<WireMessage> {
        self.rooms
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone()
    }

    fn release(&self, name: &str) {
        let mut rooms = self.rooms.lock();
        if let Some(tx) = rooms.get(name) {
            if tx.receiver_count() == 0 {
                rooms.remove(name);
            }
        }
    }

    /// Join a room, announcing presence and starting heartbeat upkeep.
    pub fn join(self: &Arc<Self>, room: &str, peer: PeerId, config: &SyncConfig) -> MeshConn {
        let tx = self.room(room);
        let rx = tx.subscribe();

        let (status_tx, _) = watch::channel(ConnectionStatus::Connecting);
        let status_tx = Arc::new(status_tx);
        let (peers_tx, _) = watch::channel(0usize);
        let peers_tx = Arc::new(peers_tx);
        let presence: Arc<Mutex<HashMap<PeerId, Instant>>> = Arc::new(Mutex::new(HashMap::new()));
        let (deltas_tx, deltas_rx) = mpsc::channel(DELTA_QUEUE);

        let rx_task = tokio::spawn(Self::pump_room(
            rx,
            tx.clone(),
            peer,
            presence.clone(),
            peers_tx.clone(),
            deltas_tx,
        ));
        let hb_task = tokio::spawn(Self::heartbeat(
            tx.clone(),
            peer,
            presence.clone(),
            peers_tx.clone(),
            config.heartbeat_interval(),
            config.peer_timeout(),
        ));

        // Our own pump task holds a receiver, so the announce cannot fail.
        if tx.send(WireMessage {
            from: peer,
            body: PeerMessage::Join,
        })
        .is_ok()
        {
            status_tx.send_replace(ConnectionStatus::Online);
        }

        MeshConn {
            peer,
            room: room.to_string(),
            hub: self.clone(),
            tx,
            status_tx,
            peers_tx,
            deltas_rx: Some(deltas_rx),
            tasks: vec![rx_task, hb_task],
        }
    }

    async fn pump_room(
        mut rx: broadcast::Receiver<WireMessage>,
        tx: broadcast::Sender<WireMessage>,
        own: PeerId,
        presence: Arc<Mutex<HashMap<PeerId, Instant>>>,
        peers_tx: Arc<watch::Sender<usize>>,
        deltas_tx: mpsc::Sender<Vec<u8>>,
    ) {
        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "mesh receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if msg.from == own {
                continue;
            }
            match msg.body {
                PeerMessage::Join => {
                    presence.lock().insert(msg.from, Instant::now());
                    peers_tx.send_replace(presence.lock().len());
                    // Reply so the joiner learns about us without waiting a
                    // full heartbeat interval.
                    let _ = tx.send(WireMessage {
                        from: own,
                        body: PeerMessage::Heartbeat,
                    });
                }
                PeerMessage::Heartbeat => {
                    presence.lock().insert(msg.from, Instant::now());
                    peers_tx.send_replace(presence.lock().len());
                }
                PeerMessage::Leave => {
                    presence.lock().remove(&msg.from);
                    peers_tx.send_replace(presence.lock().len());
                }
                PeerMessage::Delta { payload } => {
                    if deltas_tx.send(payload).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn heartbeat(
        tx: broadcast::Sender<WireMessage>,
        own: PeerId,
        presence: Arc<Mutex<HashMap<PeerId, Instant>>>,
        peers_tx: Arc<watch::Sender<usize>>,
        interval: std::time::Duration,
        timeout: std::time::Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let _ = tx.send(WireMessage {
                from: own,
                body: PeerMessage::Heartbeat,
            });
            let mut map = presence.lock();
            map.retain(|_, last| last.elapsed() < timeout);
            peers_tx.send_replace(map.len());
        }
    }
}

impl Default for MeshHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One session's membership in a room. Dropping it leaves the room.
pub struct MeshConn {
    peer: PeerId,
    room: String,
    hub: Arc<MeshHub>,
    tx: broadcast::Sender<WireMessage>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    peers_tx: Arc<watch::Sender<usize>>,
    deltas_rx: Option<mpsc::Receiver<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshConn {
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn peers(&self) -> watch::Receiver<usize> {
        self.peers_tx.subscribe()
    }

    /// Inbound deltas from other room members. Yields each queue once.
    pub fn take_deltas(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.deltas_rx.take()
    }

    pub fn sender(&self) -> MeshSender {
        MeshSender {
            peer: self.peer,
            tx: self.tx.clone(),
            status_tx: self.status_tx.clone(),
        }
    }
}

impl Drop for MeshConn {
    fn drop(&mut self) {
        let _ = self.tx.send(WireMessage {
            from: self.peer,
            body: PeerMessage::Leave,
        });
        for task in &self.tasks {
            task.abort();
        }
        self.hub.release(&self.room);
    }
}

/// Cloneable outbound handle, used by the replication pump.
#[derive(Clone)]
pub struct MeshSender {
    peer: PeerId,
    tx: broadcast::Sender<WireMessage>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
}

impl MeshSender {
    pub fn send_delta(&self, payload: Vec<u8>) -> Result<(), SyncError> {
        self.tx
            .send(WireMessage {
                from: self.peer,
                body: PeerMessage::Delta { payload },
            })
            .map(|_| ())
            .map_err(|_| {
                self.status_tx.send_replace(ConnectionStatus::Connecting);
                SyncError::Transport("room has no members".into())
            })
    }
}
