//! Room state machine.
//!
//! Pure, single-threaded state for one room: membership, the advisory
//! exclusive-edit lock and the per-room sequence counter. The runtime wraps
//! each `RoomState` in a room-scoped mutex; nothing here blocks or performs
//! I/O, so critical sections stay short.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::message::RoomSnapshot;
use crate::{RoomId, SequenceNumber, SessionId};

/// Advisory exclusive-edit lock. Expiry bounds the damage of an ungraceful
/// disconnect; the holder renews via extend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    pub holder: SessionId,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    Granted { expires_at: Instant },
    Denied { holder: SessionId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRelease {
    Released,
    NotHolder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockExtend {
    Extended { expires_at: Instant },
    NotHolder,
}

#[derive(Debug)]
pub struct RoomState {
    room_id: RoomId,
    members: HashSet<SessionId>,
    lock: Option<Lock>,
    next_sequence: SequenceNumber,
}

impl RoomState {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            members: HashSet::new(),
            lock: None,
            next_sequence: 1,
        }
    }

    /// Returns false when the session was already a member.
    pub fn join(&mut self, session_id: SessionId) -> bool {
        self.members.insert(session_id)
    }

    /// Removes the session, releasing its lock if it is the holder.
    /// Returns true when the session was a member.
    pub fn leave(&mut self, session_id: SessionId) -> bool {
        if self.lock.map(|l| l.holder) == Some(session_id) {
            self.lock = None;
        }
        self.members.remove(&session_id)
    }

    pub fn is_member(&self, session_id: SessionId) -> bool {
        self.members.contains(&session_id)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> Vec<SessionId> {
        self.members.iter().copied().collect()
    }

    /// The unexpired lock holder, if any. An expired lock means the room is
    /// back in free editing mode.
    pub fn lock_holder(&self, now: Instant) -> Option<SessionId> {
        self.lock
            .filter(|lock| lock.expires_at > now)
            .map(|lock| lock.holder)
    }

    /// Grant when nobody holds the lock, the existing lock has expired, or
    /// the requester already holds it (re-acquire renews the TTL). Ties
    /// between simultaneous requests are broken upstream by the order in
    /// which they come off the room's ordering queue.
    pub fn acquire_lock(&mut self, session_id: SessionId, ttl: Duration, now: Instant) -> LockGrant {
        match self.lock_holder(now) {
            Some(holder) if holder != session_id => LockGrant::Denied { holder },
            _ => {
                let expires_at = now + ttl;
                self.lock = Some(Lock {
                    holder: session_id,
                    expires_at,
                });
                LockGrant::Granted { expires_at }
            }
        }
    }

    pub fn release_lock(&mut self, session_id: SessionId) -> LockRelease {
        if self.lock.map(|l| l.holder) == Some(session_id) {
            self.lock = None;
            LockRelease::Released
        } else {
            LockRelease::NotHolder
        }
    }

    pub fn extend_lock(&mut self, session_id: SessionId, ttl: Duration, now: Instant) -> LockExtend {
        if self.lock_holder(now) == Some(session_id) {
            let expires_at = now + ttl;
            self.lock = Some(Lock {
                holder: session_id,
                expires_at,
            });
            LockExtend::Extended { expires_at }
        } else {
            LockExtend::NotHolder
        }
    }

    /// May `session_id` edit right now? Err carries the current holder.
    pub fn check_edit_lock(&self, session_id: SessionId, now: Instant) -> Result<(), SessionId> {
        match self.lock_holder(now) {
            Some(holder) if holder != session_id => Err(holder),
            _ => Ok(()),
        }
    }

    /// Hands out the next sequence number. Strictly increasing, gapless,
    /// never reused within the room's lifetime; the caller must only invoke
    /// this for operations that will actually be broadcast.
    pub fn assign_sequence(&mut self) -> SequenceNumber {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub fn snapshot(&self, now: Instant) -> RoomSnapshot {
        let mut members = self.members();
        members.sort_unstable();
        RoomSnapshot {
            room_id: self.room_id,
            members,
            lock_holder: self.lock_holder(now),
            lock_expires_in_ms: self
                .lock
                .filter(|lock| lock.expires_at > now)
                .map(|lock| lock.expires_at.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const TTL: Duration = Duration::from_secs(60);

    fn session() -> SessionId {
        Uuid::new_v4()
    }

    #[test]
    fn membership_round_trip() {
        let mut room = RoomState::new(42);
        let a = session();
        assert!(room.join(a));
        assert!(!room.join(a));
        assert!(room.is_member(a));
        assert!(room.leave(a));
        assert!(room.is_empty());
        assert!(!room.leave(a));
    }

    #[test]
    fn second_acquire_is_denied_with_current_holder() {
        let mut room = RoomState::new(42);
        let (a, b) = (session(), session());
        let now = Instant::now();

        assert!(matches!(room.acquire_lock(a, TTL, now), LockGrant::Granted { .. }));
        assert_eq!(room.acquire_lock(b, TTL, now), LockGrant::Denied { holder: a });
        assert_eq!(room.lock_holder(now), Some(a));
    }

    #[test]
    fn expired_lock_can_be_taken_over() {
        let mut room = RoomState::new(42);
        let (a, b) = (session(), session());
        let now = Instant::now();

        room.acquire_lock(a, Duration::from_secs(1), now);
        let later = now + Duration::from_secs(2);
        assert_eq!(room.lock_holder(later), None);
        assert!(matches!(room.acquire_lock(b, TTL, later), LockGrant::Granted { .. }));
    }

    #[test]
    fn holder_may_reacquire_and_extend() {
        let mut room = RoomState::new(42);
        let a = session();
        let now = Instant::now();

        room.acquire_lock(a, TTL, now);
        assert!(matches!(room.acquire_lock(a, TTL, now), LockGrant::Granted { .. }));
        match room.extend_lock(a, Duration::from_secs(120), now) {
            LockExtend::Extended { expires_at } => assert_eq!(expires_at, now + Duration::from_secs(120)),
            other => panic!("unexpected extend result: {:?}", other),
        }
        assert_eq!(room.extend_lock(session(), TTL, now), LockExtend::NotHolder);
    }

    #[test]
    fn release_by_non_holder_is_rejected() {
        let mut room = RoomState::new(42);
        let (a, b) = (session(), session());
        let now = Instant::now();

        room.acquire_lock(a, TTL, now);
        assert_eq!(room.release_lock(b), LockRelease::NotHolder);
        assert_eq!(room.release_lock(a), LockRelease::Released);
        assert_eq!(room.lock_holder(now), None);
    }

    #[test]
    fn leaving_releases_the_lock() {
        let mut room = RoomState::new(42);
        let (a, b) = (session(), session());
        let now = Instant::now();

        room.join(a);
        room.join(b);
        room.acquire_lock(a, TTL, now);
        room.leave(a);
        assert_eq!(room.lock_holder(now), None);
        assert!(matches!(room.acquire_lock(b, TTL, now), LockGrant::Granted { .. }));
    }

    #[test]
    fn edit_lock_check_reports_holder() {
        let mut room = RoomState::new(42);
        let (a, b) = (session(), session());
        let now = Instant::now();

        assert_eq!(room.check_edit_lock(b, now), Ok(()));
        room.acquire_lock(a, TTL, now);
        assert_eq!(room.check_edit_lock(b, now), Err(a));
        assert_eq!(room.check_edit_lock(a, now), Ok(()));
    }

    #[test]
    fn sequence_numbers_are_gapless_and_never_reused() {
        let mut room = RoomState::new(42);
        for expected in 1..=100 {
            assert_eq!(room.assign_sequence(), expected);
        }
        // Membership churn must not reset the counter.
        let a = session();
        room.join(a);
        room.leave(a);
        assert_eq!(room.assign_sequence(), 101);
    }

    #[test]
    fn snapshot_reflects_lock_state() {
        let mut room = RoomState::new(42);
        let a = session();
        let now = Instant::now();

        room.join(a);
        room.acquire_lock(a, TTL, now);
        let snapshot = room.snapshot(now);
        assert_eq!(snapshot.room_id, 42);
        assert_eq!(snapshot.members, vec![a]);
        assert_eq!(snapshot.lock_holder, Some(a));
        assert_eq!(snapshot.lock_expires_in_ms, Some(TTL.as_millis() as u64));
    }
}
