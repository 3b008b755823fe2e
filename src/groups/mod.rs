//! NIP-29 relay-based groups: per-group aggregates rebuilt from moderation
//! events, and the registry that owns them.

pub mod action;
pub mod deleted;
pub mod error;
pub mod policy;
pub mod registry;

use std::collections::BTreeMap;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;

pub use action::{Action, MetadataEdit, ModerationAction, PutTarget};
pub use deleted::DeletedEventGuard;
pub use error::{ActionError, GroupError};
pub use policy::{Authorizer, Capability, CapabilityPolicy};
pub use registry::{GroupChange, GroupRegistry, RegistryConfig};

/// Where a group lives: its id on a given relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupAddress {
    pub id: String,
    pub relay: String,
}

/// Named permission label held by members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Role {
    pub name: String,
    pub description: String,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
        }
    }
}

/// Outcome of applying one action to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Updated,
    Unchanged,
    /// The group was deleted; the owner should drop it.
    Deleted,
}

/// Reconstructed state of one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupState {
    pub address: GroupAddress,
    pub name: String,
    pub picture: String,
    pub about: String,
    pub private: bool,
    pub closed: bool,
    pub level: u32,
    pub level_until: u64,
    /// Roles members may be given.
    pub roles: Vec<Role>,
    /// Role given to members added without a known role.
    pub default_role: Option<String>,
    /// Member pubkey to the roles they hold.
    pub members: BTreeMap<String, Vec<Role>>,
    #[serde(skip)]
    pub deleted: bool,
}

impl GroupState {
    pub fn new(address: GroupAddress, roles: Vec<Role>, default_role: Option<String>) -> Self {
        Self {
            address,
            name: String::new(),
            picture: String::new(),
            about: String::new(),
            private: false,
            closed: false,
            level: 0,
            level_until: 0,
            roles,
            default_role,
            members: BTreeMap::new(),
            deleted: false,
        }
    }

    /// Known role by name.
    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Roles held by `pubkey`; empty for non-members.
    pub fn member_roles(&self, pubkey: &str) -> &[Role] {
        self.members.get(pubkey).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_member(&self, pubkey: &str) -> bool {
        self.members.contains_key(pubkey)
    }

    /// Apply one action. Never fails: authorization happens before this.
    pub fn apply(&mut self, action: &Action) -> Transition {
        match action {
            Action::CreateGroup => Transition::Unchanged,
            Action::DeleteGroup => {
                self.deleted = true;
                Transition::Deleted
            }
            Action::PutUser(targets) => {
                let mut changed = false;
                for target in targets {
                    let roles = self.resolve_roles(&target.roles);
                    let previous = self.members.insert(target.pubkey.clone(), roles.clone());
                    changed |= previous.as_ref() != Some(&roles);
                }
                changed_if(changed)
            }
            Action::RemoveUser(pubkeys) => {
                let mut changed = false;
                for pk in pubkeys {
                    changed |= self.members.remove(pk).is_some();
                }
                changed_if(changed)
            }
            Action::EditMetadata(edit) => {
                let mut changed = false;
                changed |= set_if_present(&mut self.name, &edit.name);
                changed |= set_if_present(&mut self.picture, &edit.picture);
                changed |= set_if_present(&mut self.about, &edit.about);
                changed |= set_if_present(&mut self.private, &edit.private);
                changed |= set_if_present(&mut self.closed, &edit.closed);
                changed_if(changed)
            }
            Action::EditLevel { level, until } => {
                let changed = self.level != *level || self.level_until != *until;
                self.level = *level;
                self.level_until = *until;
                changed_if(changed)
            }
            Action::EditRoles(defs) => {
                let mut changed = false;
                for (name, description) in defs {
                    match self.roles.iter_mut().find(|r| &r.name == name) {
                        Some(existing) if &existing.description == description => {}
                        Some(existing) => {
                            existing.description.clone_from(description);
                            changed = true;
                        }
                        None => {
                            self.roles.push(Role {
                                name: name.clone(),
                                description: description.clone(),
                            });
                            changed = true;
                        }
                    }
                }
                changed_if(changed)
            }
            Action::DeleteEvent(_) | Action::Unknown(_) => Transition::Unchanged,
        }
    }

    /// Keep the known roles; fall back to the default role when none survive.
    fn resolve_roles(&self, names: &[String]) -> Vec<Role> {
        let mut roles: Vec<Role> = Vec::with_capacity(names.len());
        for name in names {
            match self.role(name) {
                Some(role) if !roles.contains(role) => roles.push(role.clone()),
                Some(_) => {}
                None => tracing::debug!(group = %self.address.id, role = %name, "ignoring unknown role"),
            }
        }
        if roles.is_empty() {
            if let Some(default) = self.default_role.as_deref().and_then(|n| self.role(n)) {
                roles.push(default.clone());
            }
        }
        roles
    }
}

fn set_if_present<T: Clone + PartialEq>(field: &mut T, value: &Option<T>) -> bool {
    match value {
        Some(v) if *field != *v => {
            field.clone_from(v);
            true
        }
        _ => false,
    }
}

fn changed_if(changed: bool) -> Transition {
    if changed {
        Transition::Updated
    } else {
        Transition::Unchanged
    }
}

/// A group aggregate shared between connections. Field mutation is
/// serialized by the inner lock.
#[derive(Debug)]
pub struct Group {
    state: RwLock<GroupState>,
}

impl Group {
    pub fn new(state: GroupState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, GroupState> {
        self.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, GroupState> {
        self.state.write()
    }

    /// Apply under the write lock.
    pub fn apply(&self, action: &Action) -> Transition {
        self.state.write().apply(action)
    }

    /// Owned copy of the current state.
    pub fn snapshot(&self) -> GroupState {
        self.state.read().clone()
    }
}
