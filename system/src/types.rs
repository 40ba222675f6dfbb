use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub type SessionId = uuid::Uuid;
pub type UserId = u64;
pub type SpaceId = u64;
/// Rooms are keyed by the picture being edited.
pub type RoomId = u64;
pub type CommandId = u32;
pub type SequenceNumber = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceType {
    Private,
    Team,
    Public,
}

/// Permission-relevant classification of a room operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Join,
    Edit,
    AcquireLock,
    ReleaseLock,
    ExtendLock,
}

/// Identity resolved by the authentication collaborator at connection
/// establishment. The core never re-derives roles; it consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub space_id: SpaceId,
    pub role: Role,
    pub space_type: SpaceType,
}

/// A sequenced edit operation. Write-once: the ordering queue's consumer
/// stamps the sequence number exactly once and the event is never mutated
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditEvent {
    pub sequence: SequenceNumber,
    pub room_id: RoomId,
    pub session_id: SessionId,
    pub kind: OperationKind,
    pub payload: Vec<u8>,
    pub produced_at_ms: u64,
}

pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
