//! Double-ratchet session state.
//!
//! State separation:
//!   root key           — updated on every DH ratchet step
//!   sending chain key  — updated per sent message
//!   receiving chain key — updated per received message
//!   message key        — derived from a chain key, used once, deleted
//!
//! The state is a plain serializable record; all transitions live in
//! [`crate::session`]. Serialized state is what persists across restarts,
//! so every field (including skipped keys) round-trips through JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use veil_crypto::{Keypair, PublicKey};
use zeroize::Zeroize;

use crate::serde_hex;

/// Ratchet keypair held inside session state. The only clonable,
/// serializable key container in the crate; the secret is zeroized when
/// the owning state is dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetKeyPair {
    pub public_key: PublicKey,
    #[serde(with = "serde_hex::hex32")]
    pub private_key: [u8; 32],
}

impl RatchetKeyPair {
    pub fn generate() -> Self {
        Self::from_keypair(&Keypair::generate())
    }

    pub fn from_keypair(keys: &Keypair) -> Self {
        Self {
            public_key: keys.public(),
            private_key: *keys.secret_bytes(),
        }
    }
}

impl std::fmt::Debug for RatchetKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Keys cached for messages that have not arrived yet, per peer ratchet
/// public key (the envelope author of their chain).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedKeys {
    /// Header keys of retired chains, so late envelopes on an old chain
    /// can still have their headers opened after our keys rotated.
    #[serde(with = "serde_hex::hex32_vec")]
    pub header_keys: Vec<[u8; 32]>,
    /// Message counter → message key.
    #[serde(with = "serde_hex::hex32_map")]
    pub message_keys: HashMap<u32, [u8; 32]>,
}

/// Encrypted-then-sent alongside every message so the recipient can
/// advance its ratchet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Message number in the sender's current chain.
    pub counter: u32,
    /// Length of the sender's previous chain, for skip accounting.
    pub previous_counter: u32,
    /// The sender's announced next ratchet public key.
    pub next_key: PublicKey,
}

/// Complete double-ratchet state. Stored under
/// `v1/session/<owner>/<device>/<name>`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(with = "serde_hex::hex32")]
    pub root_key: [u8; 32],

    /// Author key of the peer's current sending chain. Never set at
    /// init; learned from the first envelope of each of their chains.
    pub their_current_key: Option<PublicKey>,
    /// The peer's announced next ratchet key.
    pub their_next_key: Option<PublicKey>,

    /// Our current chain keypair; the author key of everything we send.
    /// Absent on the responder side until its first DH step.
    pub our_current_key: Option<RatchetKeyPair>,
    /// Our announced next ratchet keypair.
    pub our_next_key: RatchetKeyPair,

    #[serde(with = "serde_hex::hex32_opt")]
    pub sending_chain_key: Option<[u8; 32]>,
    #[serde(with = "serde_hex::hex32_opt")]
    pub receiving_chain_key: Option<[u8; 32]>,

    pub sending_counter: u32,
    pub receiving_counter: u32,
    pub previous_sending_counter: u32,

    pub skipped_keys: HashMap<PublicKey, SkippedKeys>,
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(ref mut ck) = self.sending_chain_key {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.receiving_chain_key {
            ck.zeroize();
        }
        if let Some(ref mut kp) = self.our_current_key {
            kp.private_key.zeroize();
        }
        self.our_next_key.private_key.zeroize();
        for entry in self.skipped_keys.values_mut() {
            for hk in entry.header_keys.iter_mut() {
                hk.zeroize();
            }
            for mk in entry.message_keys.values_mut() {
                mk.zeroize();
            }
        }
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("their_current_key", &self.their_current_key)
            .field("their_next_key", &self.their_next_key)
            .field("our_next_key", &self.our_next_key.public_key)
            .field("sending_counter", &self.sending_counter)
            .field("receiving_counter", &self.receiving_counter)
            .field("previous_sending_counter", &self.previous_sending_counter)
            .field("skipped_chains", &self.skipped_keys.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> SessionState {
        let mut skipped = HashMap::new();
        skipped.insert(
            RatchetKeyPair::generate().public_key,
            SkippedKeys {
                header_keys: vec![[9u8; 32]],
                message_keys: HashMap::from([(3u32, [4u8; 32])]),
            },
        );
        SessionState {
            root_key: [1u8; 32],
            their_current_key: Some(RatchetKeyPair::generate().public_key),
            their_next_key: Some(RatchetKeyPair::generate().public_key),
            our_current_key: Some(RatchetKeyPair::generate()),
            our_next_key: RatchetKeyPair::generate(),
            sending_chain_key: Some([2u8; 32]),
            receiving_chain_key: None,
            sending_counter: 5,
            receiving_counter: 2,
            previous_sending_counter: 3,
            skipped_keys: skipped,
        }
    }

    #[test]
    fn serde_roundtrip_preserves_everything() {
        let state = sample_state();
        let json = serde_json::to_string(&state).unwrap();
        let restored: SessionState = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.root_key, state.root_key);
        assert_eq!(restored.their_current_key, state.their_current_key);
        assert_eq!(restored.their_next_key, state.their_next_key);
        assert_eq!(
            restored.our_current_key.as_ref().unwrap().private_key,
            state.our_current_key.as_ref().unwrap().private_key
        );
        assert_eq!(restored.our_next_key.private_key, state.our_next_key.private_key);
        assert_eq!(restored.sending_chain_key, state.sending_chain_key);
        assert_eq!(restored.receiving_chain_key, None);
        assert_eq!(restored.sending_counter, 5);
        assert_eq!(restored.receiving_counter, 2);
        assert_eq!(restored.previous_sending_counter, 3);

        let (peer, entry) = state.skipped_keys.iter().next().unwrap();
        let restored_entry = &restored.skipped_keys[peer];
        assert_eq!(restored_entry.header_keys, entry.header_keys);
        assert_eq!(restored_entry.message_keys, entry.message_keys);
    }
}
