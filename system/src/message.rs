//! Wire protocol for the duplex picture-editing connection.
//!
//! Frames are bincode-encoded. Client commands carry a `command_id` so the
//! direct response can be correlated; broadcasts originated by other
//! sessions arrive as `ServerEvent::BySystem`.

use serde::{Deserialize, Serialize};

use crate::{CommandId, EditEvent, OperationKind, RoomId, SequenceNumber, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    pub command_id: CommandId,
    pub command: ClientCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientCommand {
    JoinRoom {
        room_id: RoomId,
    },
    /// Payload is opaque to the core; only the envelope is interpreted.
    EditOp {
        room_id: RoomId,
        kind: OperationKind,
        payload: Vec<u8>,
    },
    AcquireLock {
        room_id: RoomId,
    },
    ReleaseLock {
        room_id: RoomId,
    },
    ExtendLock {
        room_id: RoomId,
    },
    Heartbeat,
    LeaveRoom {
        room_id: RoomId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Sent once, right after the identity is resolved and the session is
    /// registered.
    Connected { session_id: SessionId },
    /// Direct response to one of this client's commands.
    ByMyself {
        command_id: CommandId,
        result: CommandOutcome,
    },
    /// Broadcast caused by the room, not by this client's own command.
    BySystem { event: RoomEvent },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    RoomJoined { snapshot: RoomSnapshot },
    RoomLeft,
    LockGranted { expires_in_ms: u64 },
    LockDenied { holder: SessionId },
    LockReleased,
    LockExtended { expires_in_ms: u64 },
    NotHolder,
    HeartbeatAck,
    /// Recoverable rejection; the session stays connected.
    Rejected { rejection: Rejection },
    /// The command was refused outright (e.g. no capability for the room's
    /// space, or not a member of the addressed room).
    Denied { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomEvent {
    /// A sequenced edit. The originator receives this too, as its
    /// acknowledgment.
    Event {
        sequence: SequenceNumber,
        session_id: SessionId,
        kind: OperationKind,
        payload: Vec<u8>,
    },
    /// Membership or lock state changed (join, leave, disconnect, lock
    /// transition).
    RoomStateChanged { snapshot: RoomSnapshot },
}

impl RoomEvent {
    pub fn from_edit(event: &EditEvent) -> Self {
        RoomEvent::Event {
            sequence: event.sequence,
            session_id: event.session_id,
            kind: event.kind,
            payload: event.payload.clone(),
        }
    }
}

/// Everything a newly joined member needs to render the room: who is here
/// and who, if anyone, currently holds the edit lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub members: Vec<SessionId>,
    pub lock_holder: Option<SessionId>,
    pub lock_expires_in_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    PermissionDenied,
    LockHeldByOther { holder: SessionId },
    QueueFull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_envelope_survives_the_wire() {
        let envelope = ClientEnvelope {
            command_id: 7,
            command: ClientCommand::EditOp {
                room_id: 42,
                kind: OperationKind::Edit,
                payload: vec![1, 2, 3],
            },
        };
        let bytes = bincode::serialize(&envelope).expect("serializes");
        let decoded: ClientEnvelope = bincode::deserialize(&bytes).expect("deserializes");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn broadcast_event_survives_the_wire() {
        let event = ServerEvent::BySystem {
            event: RoomEvent::Event {
                sequence: 1,
                session_id: uuid::Uuid::new_v4(),
                kind: OperationKind::Edit,
                payload: b"stroke".to_vec(),
            },
        };
        let bytes = bincode::serialize(&event).expect("serializes");
        let decoded: ServerEvent = bincode::deserialize(&bytes).expect("deserializes");
        assert_eq!(decoded, event);
    }

    #[test]
    fn garbage_is_a_protocol_error_not_a_panic() {
        assert!(bincode::deserialize::<ClientEnvelope>(&[0xff; 3]).is_err());
    }
}
