//! Nostr event model, NIP-01 hashing and Schnorr signatures.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the rest hold data. The tags this
/// crate cares about are:
///
/// - `h` – the group an event belongs to
/// - `p` – a member public key, optionally followed by role names
/// - `e` – an event id targeted by a deletion
/// - `relay` / `challenge` – NIP-42 authentication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from string slices.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    /// Tag name, i.e. the first element.
    pub fn key(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First data element.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Core Nostr event as received from clients or read from the store.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "79be...",
///   "kind": 9000,
///   "created_at": 1700000000,
///   "tags": [["h", "pizza"], ["p", "c6047f...", "member"]],
///   "content": "",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, e.g. `9000` or `22242`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Tags in wire order.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First tag named `key` that carries at least one value.
    pub fn tag(&self, key: &str) -> Option<&Tag> {
        find_tag(&self.tags, key)
    }

    /// Value of the first tag named `key`.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tag(key).and_then(Tag::value)
    }

    /// All tags named `key`.
    pub fn tags_named<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags.iter().filter(move |t| t.key() == Some(key))
    }

    /// Group id from the `h` tag.
    pub fn group_id(&self) -> Option<&str> {
        self.tag_value("h")
    }

    /// Check that `id` matches the content hash and `sig` verifies under `pubkey`.
    pub fn verify(&self) -> Result<()> {
        let hash = event_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        if hex::encode(hash) != self.id {
            return Err(anyhow!("id mismatch"));
        }
        let sig = Signature::from_slice(&hex::decode(&self.sig)?)?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)?;
        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest_slice(&hash)?;
        secp.verify_schnorr(&sig, &msg, &pk)?;
        Ok(())
    }
}

/// Event that has not been signed yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// Hex event id this event will carry once signed.
    pub fn id(&self) -> Result<String> {
        event_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content).map(hex::encode)
    }

    /// Sign with `keys`. The author is replaced by the key's public half.
    pub fn sign(self, keys: &Keypair) -> Result<Event> {
        let pubkey = hex::encode(keys.x_only_public_key().0.serialize());
        let hash = event_hash(&pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        let secp = Secp256k1::new();
        let msg = Message::from_digest_slice(&hash)?;
        let sig = secp.sign_schnorr_no_aux_rand(&msg, keys);
        Ok(Event {
            id: hex::encode(hash),
            pubkey,
            kind: self.kind,
            created_at: self.created_at,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

fn find_tag<'a>(tags: &'a [Tag], key: &str) -> Option<&'a Tag> {
    tags.iter().find(|t| t.key() == Some(key) && t.0.len() >= 2)
}

/// NIP-01 hash: sha256 of `[0, pubkey, created_at, kind, tags, content]`.
pub(crate) fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Returns true if `s` is a 32-byte lowercase or uppercase hex string.
pub fn is_hex32(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
