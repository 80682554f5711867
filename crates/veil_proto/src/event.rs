//! Signed wire events and unsigned rumors.
//!
//! An event id is the SHA-256 of the canonical JSON array
//! `[0, pubkey, created_at, kind, tags, content]`, hex-encoded. The
//! signature is Ed25519 over the 32 raw id bytes, made by `pubkey`.
//!
//! A *rumor* is the same structure without a signature: the plaintext
//! application event that travels inside an encrypted session envelope.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use veil_crypto::{PublicKey, Signer};

use crate::error::ProtoError;

// ── Event kinds ──────────────────────────────────────────────────────────────

/// Replaceable event: AppKeys or a device Invite, selected by d-tag.
pub const REPLACEABLE_KIND: u16 = 30078;
/// Sealed invite-response envelope.
pub const INVITE_RESPONSE_KIND: u16 = 1059;
/// Encrypted session message envelope.
pub const MESSAGE_KIND: u16 = 1060;
/// Reaction rumor.
pub const REACTION_KIND: u16 = 7;
/// Chat message rumor.
pub const CHAT_MESSAGE_KIND: u16 = 14;

/// d-tag of the AppKeys replaceable event.
pub const APP_KEYS_D_TAG: &str = "double-ratchet/app-keys";
/// d-tag prefix of a device invite; the device identity pubkey follows.
pub const INVITE_D_TAG_PREFIX: &str = "double-ratchet/invites/";
/// Label tag on invite events, so one subscription catches every device.
pub const INVITE_LABEL: &str = "double-ratchet/invites";
/// Expiration tag on rumors: unix seconds after which relays and
/// clients may discard the message.
pub const EXPIRATION_TAG: &str = "expiration";

// ── Time ─────────────────────────────────────────────────────────────────────

pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

// ── Id computation ───────────────────────────────────────────────────────────

/// Canonical content-hash id over the event fields.
pub fn compute_id(
    pubkey: &PublicKey,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    let canonical = serde_json::json!([0, pubkey.to_hex(), created_at, kind, tags, content]);
    // Serializing a Value of strings and numbers cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

// ── Rumor ────────────────────────────────────────────────────────────────────

/// Unsigned plaintext event — what a session encrypts and decrypts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rumor {
    pub id: String,
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl Rumor {
    pub fn new(
        pubkey: PublicKey,
        kind: u16,
        content: impl Into<String>,
        tags: Vec<Vec<String>>,
        created_at: u64,
    ) -> Self {
        let content = content.into();
        let id = compute_id(&pubkey, created_at, kind, &tags, &content);
        Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
        }
    }

    /// Recompute the id after any field mutation.
    pub fn ensure_id(&mut self) {
        self.id = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }
}

// ── Event ────────────────────────────────────────────────────────────────────

/// Signed wire event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Build, id, and sign an event with `signer` as the author.
    pub fn finalize(
        signer: &dyn Signer,
        kind: u16,
        content: impl Into<String>,
        tags: Vec<Vec<String>>,
        created_at: u64,
    ) -> Result<Self, ProtoError> {
        let pubkey = signer.public_key();
        let content = content.into();
        let id = compute_id(&pubkey, created_at, kind, &tags, &content);
        let id_bytes = hex::decode(&id).map_err(veil_crypto::CryptoError::from)?;
        let sig = hex::encode(signer.sign(&id_bytes));
        Ok(Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
        })
    }

    /// Check that the id matches the content hash and the signature
    /// verifies under the author key.
    pub fn verify(&self) -> Result<(), ProtoError> {
        let expected = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if expected != self.id {
            return Err(ProtoError::IdMismatch);
        }
        let id_bytes = hex::decode(&self.id).map_err(veil_crypto::CryptoError::from)?;
        let sig_bytes = hex::decode(&self.sig).map_err(veil_crypto::CryptoError::from)?;
        self.pubkey.verify(&id_bytes, &sig_bytes)?;
        Ok(())
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }

    /// All values of tags named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }
}

fn tag_value<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.first().map(String::as_str) == Some(name))
        .and_then(|t| t.get(1).map(String::as_str))
}
