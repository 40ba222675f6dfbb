use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use collab_system::SessionId;

use crate::connection::ConnectionEvent;

pub type ConnectionTx = tokio::sync::mpsc::Sender<ConnectionEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The outbox is full or its connection task is gone; the session must
    /// be torn down.
    Dropped,
    /// No such session (already disconnected).
    Unknown,
}

/// Outbound channels for live connections, shared between the server task
/// and the per-room consumer tasks. All sends are `try_send`, so no holder
/// of this map ever blocks on a slow client.
#[derive(Clone, Default)]
pub struct ConnectionTxStorage {
    txs: Arc<Mutex<HashMap<SessionId, ConnectionTx>>>,
}

impl ConnectionTxStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: SessionId, tx: ConnectionTx) {
        self.lock().insert(session_id, tx);
    }

    pub fn remove(&self, session_id: &SessionId) -> Option<ConnectionTx> {
        self.lock().remove(session_id)
    }

    pub fn try_send(&self, to: &SessionId, event: ConnectionEvent) -> SendOutcome {
        match self.lock().get(to) {
            Some(tx) => match tx.try_send(event) {
                Ok(()) => SendOutcome::Sent,
                Err(_) => SendOutcome::Dropped,
            },
            None => SendOutcome::Unknown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, ConnectionTx>> {
        self.txs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
