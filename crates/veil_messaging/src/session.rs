//! Double Ratchet session.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! Each party generates a new ratchet keypair per "turn"; the DH output
//! is mixed into the root key via HKDF, producing a new root key and a
//! new chain key. Old chain keys and message keys are deleted (forward
//! secrecy); a new DH step restores secrecy after compromise.
//!
//! The envelope author field is the sender's current ratchet public key,
//! so the transport can route before anything is decrypted. Headers are
//! AEAD-encrypted under the conversation key between the sender's current
//! key and the recipient's announced key; the receive side tries its
//! current key, its next key (a success there IS the DH-step trigger),
//! and finally the header keys of retired chains kept in the skipped-key
//! cache.
//!
//! Receive is transactional: any failure restores the pre-receive state.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use veil_crypto::{aead, dh, kdf, Keypair, PublicKey};
use veil_proto::event::{self, Event, Rumor};
use veil_proto::{EventSink, Filter, RelayTransport, Subscription};

use crate::error::{Error, Result};
use crate::session_state::{Header, RatchetKeyPair, SessionState};
use crate::MAX_SKIP;

const HEADER_AAD: &[u8] = b"veil/header/v1";

/// Which key opened an incoming header.
#[derive(Clone, Copy)]
enum HeaderPath {
    /// The live receiving chain.
    CurrentChain,
    /// Our announced next key: the peer has rotated, step the ratchet.
    NextChain,
    /// A retired chain's stored header key; served from cache only.
    Skipped,
}

/// A bidirectional encrypted channel with one peer device.
///
/// Owns its ratchet state and its transport subscription handles. The
/// `name` is the id of the handshake envelope that created the session
/// on both sides, which is what makes it a replay-suppression key.
pub struct Session {
    pub state: SessionState,
    pub name: String,
    subscriptions: HashMap<PublicKey, Subscription>,
}

impl Session {
    pub fn new(state: SessionState, name: impl Into<String>) -> Self {
        Self {
            state,
            name: name.into(),
            subscriptions: HashMap::new(),
        }
    }

    /// Create a session from handshake material.
    ///
    /// The initiator (the invite acceptor) passes its fresh session
    /// keypair secret and derives the first sending chain immediately.
    /// The responder (the inviter) passes its invite ephemeral secret,
    /// which seeds `our_next_key`; it cannot send until the first
    /// incoming envelope triggers its first DH step.
    pub fn init(
        their_ephemeral_key: PublicKey,
        our_ephemeral_secret: &[u8; 32],
        is_initiator: bool,
        shared_secret: &[u8; 32],
        name: impl Into<String>,
    ) -> Result<Self> {
        let our_keys = Keypair::from_secret_bytes(our_ephemeral_secret)?;

        let state = if is_initiator {
            let our_next = RatchetKeyPair::generate();
            let mix = dh::conversation_key(&our_next.private_key, &their_ephemeral_key)?;
            let outputs = kdf::kdf(shared_secret, &mix, 2)?;
            SessionState {
                root_key: outputs[0],
                their_current_key: None,
                their_next_key: Some(their_ephemeral_key),
                our_current_key: Some(RatchetKeyPair::from_keypair(&our_keys)),
                our_next_key: our_next,
                sending_chain_key: Some(outputs[1]),
                receiving_chain_key: None,
                sending_counter: 0,
                receiving_counter: 0,
                previous_sending_counter: 0,
                skipped_keys: HashMap::new(),
            }
        } else {
            SessionState {
                root_key: *shared_secret,
                their_current_key: None,
                their_next_key: Some(their_ephemeral_key),
                our_current_key: None,
                our_next_key: RatchetKeyPair::from_keypair(&our_keys),
                sending_chain_key: None,
                receiving_chain_key: None,
                sending_counter: 0,
                receiving_counter: 0,
                previous_sending_counter: 0,
                skipped_keys: HashMap::new(),
            }
        };

        Ok(Self::new(state, name))
    }

    pub fn can_send(&self) -> bool {
        self.state.our_current_key.is_some()
            && self.state.their_next_key.is_some()
            && self.state.sending_chain_key.is_some()
    }

    // ── Send ─────────────────────────────────────────────────────────────

    /// Encrypt a rumor into a signed session envelope.
    ///
    /// State commits only after every fallible step succeeded, so a
    /// failed send leaves the chain untouched.
    pub fn send(&mut self, rumor: &Rumor) -> Result<Event> {
        let (our_current, their_next) = match (&self.state.our_current_key, self.state.their_next_key)
        {
            (Some(current), Some(next)) => (current.clone(), next),
            _ => return Err(Error::SessionNotReady),
        };
        let chain_key = self.state.sending_chain_key.ok_or(Error::SessionNotReady)?;

        let outputs = kdf::kdf(&chain_key, &[1u8], 2)?;
        let message_key = outputs[1];

        let header = Header {
            counter: self.state.sending_counter,
            previous_counter: self.state.previous_sending_counter,
            next_key: self.state.our_next_key.public_key,
        };

        let header_key = dh::conversation_key(&our_current.private_key, &their_next)?;
        let header_json = serde_json::to_string(&header)?;
        let encrypted_header =
            BASE64.encode(aead::encrypt(&header_key, header_json.as_bytes(), HEADER_AAD)?);

        let (body_key, nonce) = kdf::message_seal(&message_key)?;
        let plaintext = serde_json::to_string(rumor)?;
        let body = BASE64.encode(aead::seal(
            &body_key,
            &nonce,
            plaintext.as_bytes(),
            encrypted_header.as_bytes(),
        )?);

        let author = Keypair::from_secret_bytes(&our_current.private_key)?;
        let envelope = Event::finalize(
            &author,
            event::MESSAGE_KIND,
            body,
            vec![vec!["header".to_string(), encrypted_header]],
            event::unix_seconds(),
        )?;

        self.state.sending_chain_key = Some(outputs[0]);
        self.state.sending_counter += 1;
        Ok(envelope)
    }

    // ── Receive ──────────────────────────────────────────────────────────

    /// Decrypt a session envelope into its rumor.
    ///
    /// Duplicates, replays, and tampered envelopes all fail without
    /// mutating state; the caller drops them.
    pub fn receive(&mut self, envelope: &Event) -> Result<Rumor> {
        let snapshot = self.state.clone();
        match self.receive_inner(envelope) {
            Ok(rumor) => Ok(rumor),
            Err(err) => {
                self.state = snapshot;
                Err(err)
            }
        }
    }

    fn receive_inner(&mut self, envelope: &Event) -> Result<Rumor> {
        if envelope.kind != event::MESSAGE_KIND {
            return Err(Error::Undecryptable("not a session envelope"));
        }
        let encrypted_header = envelope
            .tag_value("header")
            .ok_or(Error::Undecryptable("missing header tag"))?
            .to_string();
        let header_bytes = BASE64
            .decode(&encrypted_header)
            .map_err(|_| Error::Undecryptable("header encoding"))?;
        let author = envelope.pubkey;

        let (header, path) = self.open_header(&header_bytes, &author)?;

        if matches!(path, HeaderPath::Skipped) {
            return self
                .take_skipped(&author, header.counter, &envelope.content, &encrypted_header)?
                .ok_or(Error::Undecryptable("no cached key for retired chain"));
        }

        if matches!(path, HeaderPath::NextChain) {
            if self.state.receiving_chain_key.is_some() {
                if let Some(old_author) = self.state.their_current_key {
                    self.stash_retiring_chain(header.previous_counter, old_author)?;
                }
            }
            self.state.their_current_key = Some(author);
            self.state.their_next_key = Some(header.next_key);
            self.ratchet_step()?;
        } else if self.state.their_current_key != Some(author) {
            return Err(Error::Undecryptable("unexpected author"));
        }

        if let Some(rumor) =
            self.take_skipped(&author, header.counter, &envelope.content, &encrypted_header)?
        {
            return Ok(rumor);
        }

        self.skip_message_keys(header.counter, author)?;

        let chain_key = self.state.receiving_chain_key.ok_or(Error::SessionNotReady)?;
        let outputs = kdf::kdf(&chain_key, &[1u8], 2)?;
        self.state.receiving_chain_key = Some(outputs[0]);
        self.state.receiving_counter += 1;

        Self::open_body(&outputs[1], &envelope.content, &encrypted_header)
    }

    fn open_header(&self, header_bytes: &[u8], author: &PublicKey) -> Result<(Header, HeaderPath)> {
        if let Some(ref current) = self.state.our_current_key {
            if let Ok(key) = dh::conversation_key(&current.private_key, author) {
                if let Ok(plaintext) = aead::decrypt(&key, header_bytes, HEADER_AAD) {
                    return Ok((parse_header(&plaintext)?, HeaderPath::CurrentChain));
                }
            }
        }

        if let Ok(key) = dh::conversation_key(&self.state.our_next_key.private_key, author) {
            if let Ok(plaintext) = aead::decrypt(&key, header_bytes, HEADER_AAD) {
                return Ok((parse_header(&plaintext)?, HeaderPath::NextChain));
            }
        }

        if let Some(entry) = self.state.skipped_keys.get(author) {
            for header_key in &entry.header_keys {
                if let Ok(plaintext) = aead::decrypt(header_key, header_bytes, HEADER_AAD) {
                    return Ok((parse_header(&plaintext)?, HeaderPath::Skipped));
                }
            }
        }

        Err(Error::Undecryptable("header"))
    }

    /// Decrypt with a cached skipped message key, consuming it. The
    /// entry is dropped once its last message key is used.
    fn take_skipped(
        &mut self,
        author: &PublicKey,
        counter: u32,
        content: &str,
        encrypted_header: &str,
    ) -> Result<Option<Rumor>> {
        let message_key = match self.state.skipped_keys.get_mut(author) {
            Some(entry) => match entry.message_keys.remove(&counter) {
                Some(key) => key,
                None => return Ok(None),
            },
            None => return Ok(None),
        };

        let rumor = Self::open_body(&message_key, content, encrypted_header)?;

        if self
            .state
            .skipped_keys
            .get(author)
            .is_some_and(|entry| entry.message_keys.is_empty())
        {
            self.state.skipped_keys.remove(author);
        }
        Ok(Some(rumor))
    }

    fn open_body(message_key: &[u8; 32], content: &str, encrypted_header: &str) -> Result<Rumor> {
        let (body_key, nonce) = kdf::message_seal(message_key)?;
        let ciphertext = BASE64
            .decode(content)
            .map_err(|_| Error::Undecryptable("body encoding"))?;
        let plaintext = aead::open(&body_key, &nonce, &ciphertext, encrypted_header.as_bytes())
            .map_err(|_| Error::Undecryptable("body authentication"))?;
        let mut rumor: Rumor =
            serde_json::from_slice(&plaintext).map_err(|_| Error::Undecryptable("rumor json"))?;
        // The id travels implicitly; recompute it from content.
        rumor.ensure_id();
        Ok(rumor)
    }

    /// Advance the receiving chain to `until`, caching the message keys
    /// passed over under `author`.
    fn skip_message_keys(&mut self, until: u32, author: PublicKey) -> Result<()> {
        if until <= self.state.receiving_counter {
            return Ok(());
        }
        if (until - self.state.receiving_counter) as usize > MAX_SKIP {
            return Err(Error::SkippedKeysExhausted);
        }

        let mut counter = self.state.receiving_counter;
        let mut chain_key = self.state.receiving_chain_key.ok_or(Error::SessionNotReady)?;
        let entry = self.state.skipped_keys.entry(author).or_default();

        while counter < until {
            let outputs = kdf::kdf(&chain_key, &[1u8], 2)?;
            chain_key = outputs[0];
            entry.message_keys.insert(counter, outputs[1]);
            counter += 1;
        }

        // Oldest-first eviction keeps the per-chain cache bounded even
        // across repeated partial skips.
        if entry.message_keys.len() > MAX_SKIP {
            let mut counters: Vec<u32> = entry.message_keys.keys().copied().collect();
            counters.sort_unstable();
            let excess = entry.message_keys.len() - MAX_SKIP;
            for c in counters.into_iter().take(excess) {
                entry.message_keys.remove(&c);
            }
        }

        self.state.receiving_counter = counter;
        self.state.receiving_chain_key = Some(chain_key);
        Ok(())
    }

    /// Cache the unused keys of the receiving chain that is about to be
    /// replaced, together with its header key, keyed by the retiring
    /// chain's author.
    fn stash_retiring_chain(&mut self, previous_counter: u32, old_author: PublicKey) -> Result<()> {
        self.skip_message_keys(previous_counter, old_author)?;

        if let Some(ref current) = self.state.our_current_key {
            let header_key = dh::conversation_key(&current.private_key, &old_author)?;
            if let Some(entry) = self.state.skipped_keys.get_mut(&old_author) {
                if !entry.header_keys.contains(&header_key) {
                    entry.header_keys.push(header_key);
                }
            }
        }
        Ok(())
    }

    /// One DH ratchet turn: derive the new receiving chain from the
    /// peer's announced key, rotate our keypair, derive the new sending
    /// chain, and commit the new root.
    fn ratchet_step(&mut self) -> Result<()> {
        self.state.previous_sending_counter = self.state.sending_counter;
        self.state.sending_counter = 0;
        self.state.receiving_counter = 0;

        let their_next = self.state.their_next_key.ok_or(Error::SessionNotReady)?;

        let receive_mix = dh::conversation_key(&self.state.our_next_key.private_key, &their_next)?;
        let outputs = kdf::kdf(&self.state.root_key, &receive_mix, 2)?;
        self.state.receiving_chain_key = Some(outputs[1]);

        self.state.our_current_key = Some(self.state.our_next_key.clone());
        self.state.our_next_key = RatchetKeyPair::generate();

        let send_mix = dh::conversation_key(&self.state.our_next_key.private_key, &their_next)?;
        let outputs2 = kdf::kdf(&outputs[0], &send_mix, 2)?;
        self.state.root_key = outputs2[0];
        self.state.sending_chain_key = Some(outputs2[1]);
        Ok(())
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    /// Author keys this session needs envelopes for: the peer's current
    /// and next chain keys plus every retired chain still in the
    /// skipped-key cache.
    pub fn desired_author_keys(&self) -> Vec<PublicKey> {
        let mut keys = Vec::new();
        if let Some(k) = self.state.their_current_key {
            keys.push(k);
        }
        if let Some(k) = self.state.their_next_key {
            if !keys.contains(&k) {
                keys.push(k);
            }
        }
        for k in self.state.skipped_keys.keys() {
            if !keys.contains(k) {
                keys.push(*k);
            }
        }
        keys
    }

    /// Reconcile transport subscriptions with the current key set.
    /// Dropped handles unsubscribe on their own.
    pub fn sync_subscriptions(&mut self, relay: &dyn RelayTransport, sink: &EventSink) {
        let desired = self.desired_author_keys();
        self.subscriptions.retain(|key, _| desired.contains(key));
        for key in desired {
            if let std::collections::hash_map::Entry::Vacant(slot) = self.subscriptions.entry(key)
            {
                let filter = Filter::new().kind(event::MESSAGE_KIND).author(key);
                slot.insert(relay.subscribe(filter, Arc::clone(sink)));
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Release all transport subscriptions.
    pub fn close(&mut self) {
        self.subscriptions.clear();
    }
}

fn parse_header(plaintext: &[u8]) -> Result<Header> {
    serde_json::from_slice(plaintext).map_err(|_| Error::Undecryptable("header json"))
}
