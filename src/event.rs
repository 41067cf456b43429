//! Relay wire events.
//!
//! An event is the only thing a relay ever stores: an author public key, a
//! kind, opaque (already encrypted) content, and an Ed25519 signature over
//! the canonical serialization. The id is the SHA-256 of that serialization,
//! which is also what multi-relay deduplication keys on.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::{verify_signature, Identity};

/// Event kinds understood by the substrate.
pub mod kind {
    /// Direct message sealed to one recipient (`p` tag addresses it).
    pub const DIRECT: u16 = 4;
    /// Group message sealed under a topic (`g` tag carries the group id).
    pub const GROUP: u16 = 42;
    /// Signed group control event (role and membership transitions).
    pub const GROUP_CONTROL: u16 = 9000;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Build, id and sign a new event authored by `identity`.
    pub fn build(
        identity: &Identity,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Self {
        let pubkey = identity.public_key_hex().to_string();
        let created_at = now_secs();
        let digest = canonical_digest(&pubkey, created_at, kind, &tags, &content);
        let sig = hex::encode(identity.sign(&digest).to_bytes());
        Self {
            id: hex::encode(digest),
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
        }
    }

    /// True iff the id matches the canonical serialization and the signature
    /// verifies against the author key.
    pub fn verify(&self) -> bool {
        let digest = canonical_digest(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if hex::encode(digest) != self.id {
            return false;
        }
        verify_signature(&self.pubkey, &digest, &self.sig)
    }

    /// First `p` tag — the addressed recipient of a direct message.
    pub fn recipient(&self) -> Option<&str> {
        self.tag_value("p")
    }

    /// First `g` tag — the group this event belongs to.
    pub fn group_id(&self) -> Option<&str> {
        self.tag_value("g")
    }

    fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }
}

fn canonical_digest(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let serialized = serde_json::to_string(&canonical).expect("canonical form serializes");
    Sha256::digest(serialized.as_bytes()).into()
}

/// What a pool subscription asks the relays for: the agent's own inbox plus
/// any number of group streams.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subscription {
    /// Deliver direct events addressed to this pubkey.
    pub recipient: Option<String>,
    /// Deliver group and control events for these group ids.
    pub group_ids: Vec<String>,
}

impl Subscription {
    pub fn matches(&self, event: &Event) -> bool {
        match event.kind {
            kind::DIRECT => match (&self.recipient, event.recipient()) {
                (Some(me), Some(to)) => me == to,
                _ => false,
            },
            kind::GROUP | kind::GROUP_CONTROL => event
                .group_id()
                .map(|g| self.group_ids.iter().any(|id| id == g))
                .unwrap_or(false),
            _ => false,
        }
    }
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ─── Tests ────────────────────────────────────────────────────────────────────
