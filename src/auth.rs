//! NIP-42 client authentication.
//!
//! The relay hands a connecting client a random challenge. The client signs
//! an event of kind [`KIND_CLIENT_AUTH`] that names the challenge and the
//! relay URL. [`validate_auth_event`] then binds the connection to the
//! event's public key.

use rand::Rng;
use tracing::debug;
use url::Url;

use crate::{
    clock::unix_now,
    event::{Event, Tag, UnsignedEvent},
};

/// Kind of a NIP-42 authentication event.
pub const KIND_CLIENT_AUTH: u32 = 22242;

/// Accepted clock skew between client and relay, in seconds.
pub const AUTH_WINDOW_SECS: u64 = 10 * 60;

/// Fresh random challenge, 16 bytes hex encoded.
pub fn new_challenge() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Build the unsigned event a client must sign to answer `challenge`.
pub fn create_challenge_event(challenge: &str, pubkey: &str, relay_url: &str) -> UnsignedEvent {
    UnsignedEvent {
        pubkey: pubkey.to_string(),
        kind: KIND_CLIENT_AUTH,
        created_at: unix_now(),
        tags: vec![
            Tag::new(["relay", relay_url]),
            Tag::new(["challenge", challenge]),
        ],
        content: String::new(),
    }
}

/// Validate `event` as an answer to `challenge` for the relay at `relay_url`.
///
/// Returns the authenticated public key, or `None` if any check fails. The
/// failing check is only logged.
pub fn validate_auth_event(event: &Event, challenge: &str, relay_url: &str) -> Option<String> {
    validate_auth_event_at(event, challenge, relay_url, unix_now())
}

/// Same as [`validate_auth_event`] with an explicit current time.
pub fn validate_auth_event_at(
    event: &Event,
    challenge: &str,
    relay_url: &str,
    now: u64,
) -> Option<String> {
    if event.kind != KIND_CLIENT_AUTH {
        debug!(kind = event.kind, "auth rejected: wrong kind");
        return None;
    }

    if !event
        .tags_named("challenge")
        .any(|t| t.value() == Some(challenge))
    {
        debug!(id = %event.id, "auth rejected: challenge mismatch");
        return None;
    }

    let Some(expected) = normalize_url(relay_url) else {
        debug!(relay_url, "auth rejected: relay url unparseable");
        return None;
    };
    let Some(claimed) = event.tag_value("relay") else {
        debug!(id = %event.id, "auth rejected: missing relay tag");
        return None;
    };
    let Some(found) = normalize_url(claimed) else {
        debug!(claimed, "auth rejected: relay tag unparseable");
        return None;
    };
    if !same_relay(&expected, &found) {
        debug!(%expected, %found, "auth rejected: relay mismatch");
        return None;
    }

    if event.created_at > now.saturating_add(AUTH_WINDOW_SECS)
        || event.created_at < now.saturating_sub(AUTH_WINDOW_SECS)
    {
        debug!(created_at = event.created_at, now, "auth rejected: outside time window");
        return None;
    }

    // most expensive, so last
    if let Err(e) = event.verify() {
        debug!(id = %event.id, error = %e, "auth rejected: bad signature");
        return None;
    }

    Some(event.pubkey.clone())
}

/// Lower-case, drop one trailing slash, parse.
fn normalize_url(input: &str) -> Option<Url> {
    let lowered = input.to_lowercase();
    let trimmed = lowered.strip_suffix('/').unwrap_or(&lowered);
    Url::parse(trimmed).ok()
}

/// Relays match on scheme, host, port and path. Query and fragment are ignored.
fn same_relay(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port() == b.port()
        && a.path() == b.path()
}
