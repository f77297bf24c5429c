//! Realtime connection identity and lifecycle state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::realtime::protocol::ServerMessage;
use crate::security::identity::Identity;

/// Relaxed ordering is sufficient; only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// ```text
/// Connecting → Authenticated → Disconnected
/// ```
/// Handshakes that fail identity never leave `Connecting` and are never registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Disconnected,
}

#[derive(Debug)]
pub(crate) struct Membership {
    pub(crate) state: ConnectionState,
    pub(crate) topics: HashSet<String>,
}

/// Hub-side view of one connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    tx: mpsc::Sender<Arc<ServerMessage>>,
    pub(crate) membership: Mutex<Membership>,
    last_seen: Mutex<Instant>,
    closed: Notify,
}

impl ConnectionHandle {
    pub(crate) fn new(identity: Identity, tx: mpsc::Sender<Arc<ServerMessage>>) -> Self {
        Self {
            id: ConnectionId::new(),
            identity,
            tx,
            membership: Mutex::new(Membership {
                state: ConnectionState::Authenticated,
                topics: HashSet::new(),
            }),
            last_seen: Mutex::new(Instant::now()),
            closed: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.membership.lock().state
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.membership.lock().topics.iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Queue a message without waiting. Errors when the queue is full or closed.
    pub fn try_send(&self, message: Arc<ServerMessage>) -> Result<(), mpsc::error::TrySendError<Arc<ServerMessage>>> {
        self.tx.try_send(message)
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(*self.last_seen.lock())
    }

    pub(crate) fn close(&self) {
        self.closed.notify_one();
    }

    /// Resolves once the hub has dropped this connection.
    pub async fn closed(&self) {
        self.closed.notified().await
    }
}
