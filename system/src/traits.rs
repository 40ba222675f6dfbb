//! Seams to the external collaborators.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::{EditEvent, Identity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unauthenticated")]
pub struct Unauthenticated;

/// Authentication collaborator. Consulted synchronously when a connection
/// is established, before any room command is accepted. Implementations
/// must be cheap and non-blocking; the real system resolves from a session
/// cookie it has already validated.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Result<Identity, Unauthenticated>;
}

/// Persistence collaborator. Invoked once per sequenced event, off the hot
/// path's critical section. Implementations must not block and must swallow
/// their own failures; a broken sink never affects live delivery.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &EditEvent);
}

/// Token-map resolver for development and tests.
pub struct StaticResolver {
    identities: HashMap<String, Identity>,
}

impl StaticResolver {
    pub fn new(identities: HashMap<String, Identity>) -> Self {
        Self { identities }
    }

    /// Loads a `{"token": {identity...}}` map, the shape produced by the
    /// auth service's export endpoint.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct TokenMap(HashMap<String, Identity>);
        let TokenMap(identities) = serde_json::from_str(json)?;
        Ok(Self { identities })
    }
}

impl IdentityResolver for StaticResolver {
    fn resolve(&self, token: &str) -> Result<Identity, Unauthenticated> {
        self.identities.get(token).copied().ok_or(Unauthenticated)
    }
}

/// Default sink: log and move on.
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn record(&self, event: &EditEvent) {
        log::debug!(
            "recorded event room={} seq={} session={}",
            event.room_id,
            event.sequence,
            event.session_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Role, SpaceType};

    #[test]
    fn static_resolver_resolves_known_tokens_only() {
        let json = r#"{
            "alice": {"user_id": 1, "space_id": 10, "role": "Editor", "space_type": "Team"},
            "bob": {"user_id": 2, "space_id": 10, "role": "Viewer", "space_type": "Team"}
        }"#;
        let resolver = StaticResolver::from_json(json).expect("valid token map");

        let alice = resolver.resolve("alice").expect("known token");
        assert_eq!(alice.role, Role::Editor);
        assert_eq!(alice.space_type, SpaceType::Team);

        assert_eq!(resolver.resolve("mallory"), Err(Unauthenticated));
    }
}
