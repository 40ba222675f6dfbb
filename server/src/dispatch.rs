//! Fan-out of room events to members.
//!
//! Delivery is independent and best-effort per recipient: each member has a
//! bounded outbox, and a full or closed outbox marks that member dead
//! instead of stalling the room consumer. Per-recipient order is send
//! order, so nobody observes sequence N+1 before N.

use collab_system::{CommandId, CommandOutcome, RoomEvent, ServerEvent, SessionId};

use crate::connection::ConnectionEvent;
use crate::connection_tx_storage::{ConnectionTxStorage, SendOutcome};

#[derive(Clone)]
pub struct Dispatcher {
    connections: ConnectionTxStorage,
}

impl Dispatcher {
    pub fn new(connections: ConnectionTxStorage) -> Self {
        Self { connections }
    }

    /// Returns the members whose outbox overflowed or vanished mid-send;
    /// the caller routes them into the normal disconnect path.
    pub fn broadcast(
        &self,
        members: &[SessionId],
        event: &RoomEvent,
        exclude: Option<SessionId>,
    ) -> Vec<SessionId> {
        let mut dead = Vec::new();
        for &member in members {
            if exclude == Some(member) {
                continue;
            }
            let egress = ConnectionEvent::Egress(ServerEvent::BySystem {
                event: event.clone(),
            });
            if self.connections.try_send(&member, egress) == SendOutcome::Dropped {
                log::warn!("dropping session {}: outbound buffer overflow", member);
                dead.push(member);
            }
        }
        dead
    }

    /// Direct response to one session's command.
    pub fn reply(&self, to: SessionId, command_id: CommandId, result: CommandOutcome) -> SendOutcome {
        self.connections.try_send(
            &to,
            ConnectionEvent::Egress(ServerEvent::ByMyself { command_id, result }),
        )
    }
}
