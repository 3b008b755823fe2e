//! Parsing NIP-29 moderation events into [`ModerationAction`]s.

use crate::event::{is_hex32, Event};

use super::error::ActionError;

pub const KIND_PUT_USER: u32 = 9000;
pub const KIND_REMOVE_USER: u32 = 9001;
pub const KIND_EDIT_METADATA: u32 = 9002;
pub const KIND_EDIT_ROLES: u32 = 9003;
pub const KIND_DELETE_EVENT: u32 = 9005;
pub const KIND_EDIT_GROUP_STATUS: u32 = 9006;
pub const KIND_CREATE_GROUP: u32 = 9007;
pub const KIND_DELETE_GROUP: u32 = 9008;
pub const KIND_EDIT_LEVEL: u32 = 9010;

/// Kinds fetched from the store when replaying a group's history.
pub const MODERATION_KINDS: &[u32] = &[
    KIND_PUT_USER,
    KIND_REMOVE_USER,
    KIND_EDIT_METADATA,
    KIND_EDIT_ROLES,
    KIND_DELETE_EVENT,
    KIND_EDIT_GROUP_STATUS,
    KIND_CREATE_GROUP,
    KIND_DELETE_GROUP,
    KIND_EDIT_LEVEL,
];

/// The moderation kind range reserved by NIP-29. Kinds in it that this
/// crate does not know parse as [`Action::Unknown`].
pub fn is_moderation_kind(kind: u32) -> bool {
    (9000..=9020).contains(&kind)
}

/// Member and the role names requested for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutTarget {
    pub pubkey: String,
    pub roles: Vec<String>,
}

/// Fields an edit-metadata action may carry. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataEdit {
    pub name: Option<String>,
    pub picture: Option<String>,
    pub about: Option<String>,
    pub private: Option<bool>,
    pub closed: Option<bool>,
}

/// The state change a moderation event asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateGroup,
    DeleteGroup,
    PutUser(Vec<PutTarget>),
    RemoveUser(Vec<String>),
    EditMetadata(MetadataEdit),
    EditLevel { level: u32, until: u64 },
    /// `(name, description)` pairs to add or redefine.
    EditRoles(Vec<(String, String)>),
    DeleteEvent(Vec<String>),
    Unknown(u32),
}

impl Action {
    /// Short name used in logs and rejection reasons.
    pub fn name(&self) -> &'static str {
        match self {
            Action::CreateGroup => "create-group",
            Action::DeleteGroup => "delete-group",
            Action::PutUser(_) => "put-user",
            Action::RemoveUser(_) => "remove-user",
            Action::EditMetadata(_) => "edit-metadata",
            Action::EditLevel { .. } => "edit-level",
            Action::EditRoles(_) => "edit-roles",
            Action::DeleteEvent(_) => "delete-event",
            Action::Unknown(_) => "unknown",
        }
    }
}

/// A parsed moderation event: who did what to which group, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationAction {
    pub group_id: String,
    pub actor: String,
    pub created_at: u64,
    pub event_id: String,
    pub action: Action,
}

impl ModerationAction {
    /// Parse a moderation event. Fails when the event is not in the
    /// moderation range or a required tag is missing or malformed.
    pub fn from_event(event: &Event) -> Result<Self, ActionError> {
        if !is_moderation_kind(event.kind) {
            return Err(ActionError::NotModeration(event.kind));
        }
        let group_id = event.group_id().ok_or(ActionError::MissingTag("h"))?;
        let action = match event.kind {
            KIND_CREATE_GROUP => Action::CreateGroup,
            KIND_DELETE_GROUP => Action::DeleteGroup,
            KIND_PUT_USER => Action::PutUser(parse_put_targets(event)?),
            KIND_REMOVE_USER => Action::RemoveUser(parse_pubkeys(event)?),
            KIND_EDIT_METADATA | KIND_EDIT_GROUP_STATUS => {
                Action::EditMetadata(parse_metadata(event))
            }
            KIND_EDIT_LEVEL => parse_level(event)?,
            KIND_EDIT_ROLES => Action::EditRoles(parse_roles(event)?),
            KIND_DELETE_EVENT => Action::DeleteEvent(parse_event_ids(event)?),
            other => Action::Unknown(other),
        };
        Ok(Self {
            group_id: group_id.to_string(),
            actor: event.pubkey.to_ascii_lowercase(),
            created_at: event.created_at,
            event_id: event.id.clone(),
            action,
        })
    }
}

fn parse_put_targets(event: &Event) -> Result<Vec<PutTarget>, ActionError> {
    let mut targets = Vec::new();
    for tag in event.tags_named("p") {
        let pubkey = checked_hex(tag.value(), "p")?;
        let roles = tag.0.iter().skip(2).filter(|r| !r.is_empty()).cloned().collect();
        targets.push(PutTarget { pubkey, roles });
    }
    if targets.is_empty() {
        return Err(ActionError::MissingTag("p"));
    }
    Ok(targets)
}

fn parse_pubkeys(event: &Event) -> Result<Vec<String>, ActionError> {
    let keys = event
        .tags_named("p")
        .map(|t| checked_hex(t.value(), "p"))
        .collect::<Result<Vec<_>, _>>()?;
    if keys.is_empty() {
        return Err(ActionError::MissingTag("p"));
    }
    Ok(keys)
}

fn parse_event_ids(event: &Event) -> Result<Vec<String>, ActionError> {
    let ids = event
        .tags_named("e")
        .map(|t| checked_hex(t.value(), "e"))
        .collect::<Result<Vec<_>, _>>()?;
    if ids.is_empty() {
        return Err(ActionError::MissingTag("e"));
    }
    Ok(ids)
}

fn checked_hex(value: Option<&str>, tag: &'static str) -> Result<String, ActionError> {
    match value {
        Some(v) if is_hex32(v) => Ok(v.to_ascii_lowercase()),
        Some(v) => Err(ActionError::InvalidTag {
            tag,
            value: v.to_string(),
        }),
        None => Err(ActionError::MissingTag(tag)),
    }
}

fn parse_metadata(event: &Event) -> MetadataEdit {
    let mut edit = MetadataEdit {
        name: event.tag_value("name").map(str::to_string),
        picture: event.tag_value("picture").map(str::to_string),
        about: event.tag_value("about").map(str::to_string),
        ..Default::default()
    };
    // flag tags are single-element, e.g. ["private"]
    for tag in &event.tags {
        match tag.key() {
            Some("private") => edit.private = Some(true),
            Some("public") => edit.private = Some(false),
            Some("closed") => edit.closed = Some(true),
            Some("open") => edit.closed = Some(false),
            _ => {}
        }
    }
    edit
}

fn parse_level(event: &Event) -> Result<Action, ActionError> {
    let level = parse_number(event, "level")?;
    let until = parse_number(event, "until")?;
    let level = u32::try_from(level).map_err(|_| ActionError::InvalidTag {
        tag: "level",
        value: level.to_string(),
    })?;
    Ok(Action::EditLevel { level, until })
}

fn parse_number(event: &Event, tag: &'static str) -> Result<u64, ActionError> {
    let raw = event.tag_value(tag).ok_or(ActionError::MissingTag(tag))?;
    raw.trim().parse().map_err(|_| ActionError::InvalidTag {
        tag,
        value: raw.to_string(),
    })
}

fn parse_roles(event: &Event) -> Result<Vec<(String, String)>, ActionError> {
    let mut roles = Vec::new();
    for tag in event.tags_named("role") {
        let name = match tag.value() {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            other => {
                return Err(ActionError::InvalidTag {
                    tag: "role",
                    value: other.unwrap_or_default().to_string(),
                })
            }
        };
        let description = tag.0.get(2).cloned().unwrap_or_default();
        roles.push((name, description));
    }
    if roles.is_empty() {
        return Err(ActionError::MissingTag("role"));
    }
    Ok(roles)
}
