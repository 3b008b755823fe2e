//! Group state and client authentication core for a Nostr relay.
//!
//! - [`auth`] issues and checks NIP-42 authentication challenges.
//! - [`groups`] rebuilds NIP-29 groups from their moderation history and
//!   applies new moderation events as they arrive.
//! - [`store`] describes what the group engine needs from an event store.

pub mod auth;
pub mod clock;
pub mod config;
pub mod event;
pub mod groups;
pub mod store;

pub use event::{Event, Tag, UnsignedEvent};
