//! Errors raised while parsing and applying moderation events.

use thiserror::Error;

/// Why a moderation event could not be turned into an action.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("kind {0} is not a moderation kind")]
    NotModeration(u32),
    #[error("missing `{0}` tag")]
    MissingTag(&'static str),
    #[error("invalid `{tag}` tag value {value:?}")]
    InvalidTag { tag: &'static str, value: String },
}

/// Why a live group event was refused at the boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GroupError {
    #[error("missing group tag")]
    MissingGroupTag,
    #[error("malformed moderation event: {0}")]
    Malformed(#[from] ActionError),
    #[error("group {0} not found")]
    UnknownGroup(String),
    #[error("group {0} already exists")]
    GroupExists(String),
    #[error("{0}")]
    Denied(String),
    #[error("event {0} was deleted")]
    RecentlyDeleted(String),
    #[error("moderation event is too old")]
    TooOld,
}
