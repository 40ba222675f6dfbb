//! Role/space permission table.
//!
//! The table is built once at startup and shared by reference; `resolve`
//! is a pure function over it, safe to call from any task without locking.

use crate::{OperationKind, Role, SpaceType};

/// Matcher for one rule dimension. `Any` is the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match<T> {
    Any,
    Is(T),
}

impl<T: PartialEq> Match<T> {
    fn matches(&self, value: &T) -> bool {
        match self {
            Match::Any => true,
            Match::Is(expected) => expected == value,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PermissionRule {
    pub role: Match<Role>,
    pub space_type: Match<SpaceType>,
    pub kind: Match<OperationKind>,
    pub allow: bool,
}

impl PermissionRule {
    pub fn allow(role: Match<Role>, space_type: Match<SpaceType>, kind: Match<OperationKind>) -> Self {
        Self {
            role,
            space_type,
            kind,
            allow: true,
        }
    }

    pub fn deny(role: Match<Role>, space_type: Match<SpaceType>, kind: Match<OperationKind>) -> Self {
        Self {
            role,
            space_type,
            kind,
            allow: false,
        }
    }
}

/// First matching rule wins; no match means deny.
#[derive(Debug, Clone)]
pub struct PermissionTable {
    rules: Vec<PermissionRule>,
}

impl PermissionTable {
    pub fn new(rules: Vec<PermissionRule>) -> Self {
        Self { rules }
    }

    pub fn resolve(&self, role: Role, space_type: SpaceType, kind: OperationKind) -> bool {
        self.rules
            .iter()
            .find(|rule| {
                rule.role.matches(&role)
                    && rule.space_type.matches(&space_type)
                    && rule.kind.matches(&kind)
            })
            .map(|rule| rule.allow)
            .unwrap_or(false)
    }
}

impl Default for PermissionTable {
    /// The stock table: admins may do anything, editors may join, edit and
    /// work the lock, viewers may only join. Space-type defaults are already
    /// folded into the role by the authentication collaborator.
    fn default() -> Self {
        Self::new(vec![
            PermissionRule::allow(Match::Is(Role::Admin), Match::Any, Match::Any),
            PermissionRule::allow(Match::Is(Role::Editor), Match::Any, Match::Any),
            PermissionRule::allow(Match::Is(Role::Viewer), Match::Any, Match::Is(OperationKind::Join)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_may_join_but_not_edit() {
        let table = PermissionTable::default();
        assert!(table.resolve(Role::Viewer, SpaceType::Team, OperationKind::Join));
        assert!(!table.resolve(Role::Viewer, SpaceType::Team, OperationKind::Edit));
        assert!(!table.resolve(Role::Viewer, SpaceType::Public, OperationKind::AcquireLock));
    }

    #[test]
    fn editor_may_edit_in_every_space_type() {
        let table = PermissionTable::default();
        for space_type in [SpaceType::Private, SpaceType::Team, SpaceType::Public] {
            assert!(table.resolve(Role::Editor, space_type, OperationKind::Edit));
            assert!(table.resolve(Role::Editor, space_type, OperationKind::AcquireLock));
        }
    }

    #[test]
    fn admin_wildcard_covers_everything() {
        let table = PermissionTable::default();
        for kind in [
            OperationKind::Join,
            OperationKind::Edit,
            OperationKind::AcquireLock,
            OperationKind::ReleaseLock,
            OperationKind::ExtendLock,
        ] {
            assert!(table.resolve(Role::Admin, SpaceType::Private, kind));
        }
    }

    #[test]
    fn unmatched_input_is_denied() {
        let table = PermissionTable::new(vec![]);
        assert!(!table.resolve(Role::Admin, SpaceType::Team, OperationKind::Edit));
    }

    #[test]
    fn first_matching_rule_wins() {
        let table = PermissionTable::new(vec![
            PermissionRule::deny(Match::Is(Role::Editor), Match::Is(SpaceType::Public), Match::Is(OperationKind::Edit)),
            PermissionRule::allow(Match::Is(Role::Editor), Match::Any, Match::Any),
        ]);
        assert!(!table.resolve(Role::Editor, SpaceType::Public, OperationKind::Edit));
        assert!(table.resolve(Role::Editor, SpaceType::Team, OperationKind::Edit));
    }

    #[test]
    fn resolve_is_stable_across_repeated_calls() {
        let table = PermissionTable::default();
        let first = table.resolve(Role::Viewer, SpaceType::Team, OperationKind::Edit);
        for _ in 0..100 {
            assert_eq!(first, table.resolve(Role::Viewer, SpaceType::Team, OperationKind::Edit));
        }
    }
}
