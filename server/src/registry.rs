//! Connection registry: the set of live sessions and their identities.
//!
//! Owned exclusively by the server task. `sweep_expired` only detects stale
//! sessions; the caller drives the full disconnect path for each, exactly
//! once, which keeps the detection logic independently testable.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use collab_system::error::RegistryError;
use collab_system::{Identity, RoomId, SessionId};

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub identity: Identity,
    pub room_id: Option<RoomId>,
    pub connected_at: Instant,
    pub last_heartbeat_at: Instant,
}

impl SessionRecord {
    pub fn new(session_id: SessionId, identity: Identity, now: Instant) -> Self {
        Self {
            session_id,
            identity,
            room_id: None,
            connected_at: now,
            last_heartbeat_at: now,
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: HashMap<SessionId, SessionRecord>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, record: SessionRecord) -> Result<(), RegistryError> {
        if self.sessions.contains_key(&record.session_id) {
            return Err(RegistryError::DuplicateSession(record.session_id));
        }
        self.sessions.insert(record.session_id, record);
        Ok(())
    }

    pub fn unregister(&mut self, session_id: &SessionId) -> Option<SessionRecord> {
        self.sessions.remove(session_id)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&SessionRecord> {
        self.sessions.get(session_id)
    }

    pub fn touch_heartbeat(&mut self, session_id: &SessionId, now: Instant) -> Result<(), RegistryError> {
        let record = self
            .sessions
            .get_mut(session_id)
            .ok_or(RegistryError::UnknownSession(*session_id))?;
        record.last_heartbeat_at = now;
        Ok(())
    }

    pub fn set_room(&mut self, session_id: &SessionId, room_id: Option<RoomId>) {
        if let Some(record) = self.sessions.get_mut(session_id) {
            record.room_id = room_id;
        }
    }

    /// Sessions whose last heartbeat is older than `timeout`. Detection
    /// only; no side effects.
    pub fn sweep_expired(&self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|record| now.saturating_duration_since(record.last_heartbeat_at) > timeout)
            .map(|record| record.session_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_system::{Role, SpaceType};
    use uuid::Uuid;

    fn identity() -> Identity {
        Identity {
            user_id: 1,
            space_id: 1,
            role: Role::Editor,
            space_type: SpaceType::Team,
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ConnectionRegistry::new();
        let session_id = Uuid::new_v4();
        let now = Instant::now();

        registry
            .register(SessionRecord::new(session_id, identity(), now))
            .expect("first registration succeeds");
        assert_eq!(
            registry.register(SessionRecord::new(session_id, identity(), now)),
            Err(RegistryError::DuplicateSession(session_id))
        );
    }

    #[test]
    fn sweep_detects_only_stale_sessions() {
        let mut registry = ConnectionRegistry::new();
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let start = Instant::now();
        let timeout = Duration::from_secs(30);

        registry
            .register(SessionRecord::new(stale, identity(), start))
            .expect("registers");
        registry
            .register(SessionRecord::new(fresh, identity(), start))
            .expect("registers");

        let later = start + Duration::from_secs(31);
        registry
            .touch_heartbeat(&fresh, later)
            .expect("session exists");

        assert_eq!(registry.sweep_expired(later, timeout), vec![stale]);
        // Detection has no side effects: a second sweep sees the same set.
        assert_eq!(registry.sweep_expired(later, timeout), vec![stale]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unregister_forgets_the_session() {
        let mut registry = ConnectionRegistry::new();
        let session_id = Uuid::new_v4();
        let now = Instant::now();

        registry
            .register(SessionRecord::new(session_id, identity(), now))
            .expect("registers");
        assert!(!registry.is_empty());

        let record = registry.unregister(&session_id).expect("session exists");
        assert_eq!(record.session_id, session_id);
        assert!(registry.is_empty());
        assert!(registry.unregister(&session_id).is_none());
    }

    #[test]
    fn touching_an_unknown_session_fails() {
        let mut registry = ConnectionRegistry::new();
        let session_id = Uuid::new_v4();
        assert_eq!(
            registry.touch_heartbeat(&session_id, Instant::now()),
            Err(RegistryError::UnknownSession(session_id))
        );
    }
}
