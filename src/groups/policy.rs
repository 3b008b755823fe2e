//! Authorization of live moderation actions.

use std::collections::{HashMap, HashSet};

use super::{action::Action, GroupState, Role};

/// Decides whether `actor`, holding `roles` in `group`, may perform `action`.
///
/// Hosts supply their own policy; [`CapabilityPolicy`] covers the common
/// role-based case. The registry calls it once per live action while it
/// holds the group's write lock.
pub trait Authorizer: Send + Sync {
    fn allow(&self, group: &GroupState, actor: &str, roles: &[Role], action: &Action) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&GroupState, &str, &[Role], &Action) -> bool + Send + Sync,
{
    fn allow(&self, group: &GroupState, actor: &str, roles: &[Role], action: &Action) -> bool {
        self(group, actor, roles, action)
    }
}

/// What a role lets its holder do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ManageMembers,
    EditMetadata,
    EditRoles,
    DeleteEvents,
    DeleteGroup,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::ManageMembers,
        Capability::EditMetadata,
        Capability::EditRoles,
        Capability::DeleteEvents,
        Capability::DeleteGroup,
    ];

    /// Capability needed for `action`. `None` for actions outside the role
    /// model (creation, level changes, unknown kinds).
    pub fn required_for(action: &Action) -> Option<Capability> {
        match action {
            Action::PutUser(_) | Action::RemoveUser(_) => Some(Capability::ManageMembers),
            Action::EditMetadata(_) => Some(Capability::EditMetadata),
            Action::EditRoles(_) => Some(Capability::EditRoles),
            Action::DeleteEvent(_) => Some(Capability::DeleteEvents),
            Action::DeleteGroup => Some(Capability::DeleteGroup),
            Action::CreateGroup | Action::EditLevel { .. } | Action::Unknown(_) => None,
        }
    }
}

/// Role-based policy: each role name grants a set of capabilities.
///
/// Anyone may create a group. Level changes belong to the relay owner only,
/// who may also do anything else. Unknown kinds are refused.
#[derive(Debug, Clone, Default)]
pub struct CapabilityPolicy {
    grants: HashMap<String, HashSet<Capability>>,
    relay_owner: Option<String>,
}

impl CapabilityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// `admin` gets everything, `moderator` manages members and deletes events.
    pub fn standard(relay_owner: Option<String>) -> Self {
        Self::new()
            .grant("admin", Capability::ALL)
            .grant(
                "moderator",
                [Capability::ManageMembers, Capability::DeleteEvents],
            )
            .with_relay_owner(relay_owner)
    }

    pub fn grant(mut self, role: &str, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.grants.entry(role.to_string()).or_default().extend(caps);
        self
    }

    pub fn with_relay_owner(mut self, owner: Option<String>) -> Self {
        self.relay_owner = owner.map(|o| o.to_ascii_lowercase());
        self
    }

    fn has(&self, roles: &[Role], cap: Capability) -> bool {
        roles
            .iter()
            .filter_map(|r| self.grants.get(&r.name))
            .any(|caps| caps.contains(&cap))
    }
}

impl Authorizer for CapabilityPolicy {
    fn allow(&self, _group: &GroupState, actor: &str, roles: &[Role], action: &Action) -> bool {
        if self.relay_owner.as_deref() == Some(actor) {
            return true;
        }
        match action {
            Action::CreateGroup => true,
            Action::EditLevel { .. } | Action::Unknown(_) => false,
            other => Capability::required_for(other).is_some_and(|cap| self.has(roles, cap)),
        }
    }
}
