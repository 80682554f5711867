//! Device invites: the published bootstrap bundle and the handshake.
//!
//! Every device advertises a replaceable invite event carrying an
//! ephemeral DH public key and a shared secret. A peer device *accepts*
//! the invite: it builds an initiator session against the ephemeral key
//! and publishes an encrypted response from which the inviter constructs
//! the matching responder session. The response envelope id becomes the
//! session name on both sides.
//!
//! Response layering, outermost first:
//!   1. envelope: conversation key (fresh random sender, inviter ephemeral)
//!   2. shared-secret layer: key derived from the invite's shared secret
//!   3. identity layer: conversation key (invitee identity, inviter identity)
//!
//! The outer sender keypair is random per response, so the envelope does
//! not reveal the invitee identity to observers; the identity only
//! appears inside layer 2.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use veil_crypto::{aead, dh, kdf, Keypair, PublicKey};
use veil_proto::event::{self, Event};
use veil_proto::Filter;

use crate::error::{Error, Result};
use crate::serde_hex;
use crate::session::Session;

const ENVELOPE_AAD: &[u8] = b"veil/invite/envelope";
const SECRET_AAD: &[u8] = b"veil/invite/secret";
const IDENTITY_AAD: &[u8] = b"veil/invite/identity";

/// A device's advertised bootstrap bundle.
///
/// Value-like: cheap to clone and exchanged by copy. Only the device
/// that created the invite holds `ephemeral_secret`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Invite {
    /// The inviting device's identity key; doubles as the device id.
    pub inviter: PublicKey,
    pub ephemeral_public: PublicKey,
    #[serde(with = "serde_hex::hex32")]
    pub shared_secret: [u8; 32],
    #[serde(default, with = "serde_hex::hex32_opt")]
    pub ephemeral_secret: Option<[u8; 32]>,
    /// Owner pubkey, once known.
    pub owner: Option<PublicKey>,
    pub created_at: u64,
}

/// Outcome of decrypting an invite response on the inviter side.
pub struct InviteResponse {
    pub session: Session,
    pub invitee_identity: PublicKey,
    pub owner: Option<PublicKey>,
}

impl Invite {
    /// Mint a fresh invite for `device_identity`: new ephemeral keypair,
    /// new 32-byte shared secret. Supersedes any prior invite for the
    /// device once published.
    pub fn create(device_identity: PublicKey) -> Self {
        let ephemeral = Keypair::generate();
        let mut shared_secret = [0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut shared_secret);

        Self {
            inviter: device_identity,
            ephemeral_public: ephemeral.public(),
            shared_secret,
            ephemeral_secret: Some(*ephemeral.secret_bytes()),
            owner: None,
            created_at: event::unix_seconds(),
        }
    }

    /// The replaceable invite event, signed by the device identity key.
    pub fn to_event(&self, device_keys: &Keypair) -> Result<Event> {
        if device_keys.public() != self.inviter {
            return Err(Error::Invite("signing key does not match inviter".into()));
        }
        let tags = vec![
            vec![
                "d".to_string(),
                format!("{}{}", event::INVITE_D_TAG_PREFIX, self.inviter.to_hex()),
            ],
            vec!["l".to_string(), event::INVITE_LABEL.to_string()],
            vec!["ephemeral".to_string(), self.ephemeral_public.to_hex()],
            vec!["secret".to_string(), hex::encode(self.shared_secret)],
        ];
        Ok(Event::finalize(
            device_keys,
            event::REPLACEABLE_KIND,
            "",
            tags,
            self.created_at,
        )?)
    }

    /// Parse and validate a published invite event.
    pub fn from_event(invite_event: &Event) -> Result<Self> {
        invite_event
            .verify()
            .map_err(|e| Error::Invite(format!("bad signature: {e}")))?;
        if invite_event.kind != event::REPLACEABLE_KIND {
            return Err(Error::Invite("wrong kind".into()));
        }

        let d_tag = invite_event
            .tag_value("d")
            .ok_or_else(|| Error::Invite("missing d tag".into()))?;
        let device_hex = d_tag
            .strip_prefix(event::INVITE_D_TAG_PREFIX)
            .ok_or_else(|| Error::Invite("not an invite d tag".into()))?;
        if device_hex != invite_event.pubkey.to_hex() {
            return Err(Error::Invite("d tag does not match author".into()));
        }

        let ephemeral_public = invite_event
            .tag_value("ephemeral")
            .ok_or_else(|| Error::Invite("missing ephemeral tag".into()))
            .and_then(|s| PublicKey::from_hex(s).map_err(|e| Error::Invite(e.to_string())))?;

        let secret_hex = invite_event
            .tag_value("secret")
            .ok_or_else(|| Error::Invite("missing secret tag".into()))?;
        let secret_bytes = hex::decode(secret_hex).map_err(|e| Error::Invite(e.to_string()))?;
        let shared_secret: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| Error::Invite("shared secret must be 32 bytes".into()))?;

        Ok(Self {
            inviter: invite_event.pubkey,
            ephemeral_public,
            shared_secret,
            ephemeral_secret: None,
            owner: None,
            created_at: invite_event.created_at,
        })
    }

    /// Filter matching the published invite of one device.
    pub fn filter_for_device(device: PublicKey) -> Filter {
        Filter::new()
            .kind(event::REPLACEABLE_KIND)
            .author(device)
            .d_tag(format!("{}{}", event::INVITE_D_TAG_PREFIX, device.to_hex()))
    }

    /// Filter matching responses to this invite.
    pub fn response_filter(&self) -> Filter {
        Filter::new()
            .kind(event::INVITE_RESPONSE_KIND)
            .p_tag(self.ephemeral_public)
    }

    // ── Accepting side ───────────────────────────────────────────────────

    /// Accept the invite: build the initiator session and the sealed
    /// response envelope announcing our session key to the inviter.
    pub fn accept(
        &self,
        our_device: &Keypair,
        our_owner: PublicKey,
    ) -> Result<(Session, Event)> {
        let session_keys = Keypair::generate();
        let mut session = Session::init(
            self.ephemeral_public,
            session_keys.secret_bytes(),
            true,
            &self.shared_secret,
            "",
        )?;

        let payload = serde_json::json!({
            "sessionKey": session_keys.public().to_hex(),
            "ownerPublicKey": our_owner.to_hex(),
        });

        let identity_key = dh::conversation_key(our_device.secret_bytes(), &self.inviter)?;
        let identity_layer = BASE64.encode(aead::encrypt(
            &identity_key,
            payload.to_string().as_bytes(),
            IDENTITY_AAD,
        )?);

        let secret_key = kdf::kdf(&self.shared_secret, b"invite/secret", 1)?[0];
        let secret_layer =
            BASE64.encode(aead::encrypt(&secret_key, identity_layer.as_bytes(), SECRET_AAD)?);

        let inner = serde_json::json!({
            "pubkey": our_device.public().to_hex(),
            "created_at": event::unix_seconds(),
            "content": secret_layer,
        });

        // Fresh sender per response: the envelope must not out the
        // invitee identity to observers.
        let response_keys = Keypair::generate();
        let envelope_key =
            dh::conversation_key(response_keys.secret_bytes(), &self.ephemeral_public)?;
        let content = BASE64.encode(aead::encrypt(
            &envelope_key,
            inner.to_string().as_bytes(),
            ENVELOPE_AAD,
        )?);

        // Backdate randomly so response timing does not leak either.
        let now = event::unix_seconds();
        let two_days = 2 * 24 * 60 * 60;
        let backdated = now.saturating_sub(rand::random::<u64>() % two_days);

        let envelope = Event::finalize(
            &response_keys,
            event::INVITE_RESPONSE_KIND,
            content,
            vec![vec!["p".to_string(), self.ephemeral_public.to_hex()]],
            backdated,
        )?;

        session.name = envelope.id.clone();
        Ok((session, envelope))
    }

    // ── Inviting side ────────────────────────────────────────────────────

    /// Decrypt an invite response and build the responder session.
    ///
    /// Fails (and the event is dropped) when this invite did not produce
    /// the response or when any layer does not authenticate.
    pub fn process_response(
        &self,
        envelope: &Event,
        our_device: &Keypair,
    ) -> Result<InviteResponse> {
        let ephemeral_secret = self
            .ephemeral_secret
            .ok_or_else(|| Error::Invite("ephemeral secret unavailable".into()))?;

        let envelope_key = dh::conversation_key(&ephemeral_secret, &envelope.pubkey)?;
        let envelope_ct = BASE64
            .decode(&envelope.content)
            .map_err(|_| Error::Undecryptable("invite response encoding"))?;
        let inner_bytes = aead::decrypt(&envelope_key, &envelope_ct, ENVELOPE_AAD)
            .map_err(|_| Error::Undecryptable("invite response envelope"))?;
        let inner: serde_json::Value = serde_json::from_slice(&inner_bytes)
            .map_err(|_| Error::Undecryptable("invite response json"))?;

        let invitee_identity = inner["pubkey"]
            .as_str()
            .ok_or(Error::Undecryptable("invite response pubkey"))
            .and_then(|s| {
                PublicKey::from_hex(s).map_err(|_| Error::Undecryptable("invite response pubkey"))
            })?;

        let secret_key = kdf::kdf(&self.shared_secret, b"invite/secret", 1)?[0];
        let secret_ct = inner["content"]
            .as_str()
            .ok_or(Error::Undecryptable("invite response content"))
            .and_then(|s| {
                BASE64
                    .decode(s)
                    .map_err(|_| Error::Undecryptable("invite response content"))
            })?;
        let identity_layer = aead::decrypt(&secret_key, &secret_ct, SECRET_AAD)
            .map_err(|_| Error::Undecryptable("invite response secret layer"))?;

        let identity_key = dh::conversation_key(our_device.secret_bytes(), &invitee_identity)?;
        let identity_ct = BASE64
            .decode(&identity_layer[..])
            .map_err(|_| Error::Undecryptable("invite response identity layer"))?;
        let payload_bytes = aead::decrypt(&identity_key, &identity_ct, IDENTITY_AAD)
            .map_err(|_| Error::Undecryptable("invite response identity layer"))?;
        let payload: serde_json::Value = serde_json::from_slice(&payload_bytes)
            .map_err(|_| Error::Undecryptable("invite response payload"))?;

        let session_public = payload["sessionKey"]
            .as_str()
            .ok_or(Error::Undecryptable("invite response session key"))
            .and_then(|s| {
                PublicKey::from_hex(s).map_err(|_| Error::Undecryptable("invite response session key"))
            })?;
        let owner = payload["ownerPublicKey"]
            .as_str()
            .and_then(|s| PublicKey::from_hex(s).ok());

        let session = Session::init(
            session_public,
            &ephemeral_secret,
            false,
            &self.shared_secret,
            envelope.id.clone(),
        )?;

        Ok(InviteResponse {
            session,
            invitee_identity,
            owner,
        })
    }
}

impl std::fmt::Debug for Invite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invite")
            .field("inviter", &self.inviter)
            .field("ephemeral_public", &self.ephemeral_public)
            .field("owner", &self.owner)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_proto::event::{Rumor, CHAT_MESSAGE_KIND};

    fn rumor(content: &str) -> Rumor {
        Rumor::new(
            Keypair::generate().public(),
            CHAT_MESSAGE_KIND,
            content,
            vec![],
            1_700_000_000,
        )
    }

    #[test]
    fn event_roundtrip() {
        let device = Keypair::generate();
        let invite = Invite::create(device.public());
        let invite_event = invite.to_event(&device).unwrap();
        invite_event.verify().unwrap();

        let parsed = Invite::from_event(&invite_event).unwrap();
        assert_eq!(parsed.inviter, device.public());
        assert_eq!(parsed.ephemeral_public, invite.ephemeral_public);
        assert_eq!(parsed.shared_secret, invite.shared_secret);
        assert_eq!(parsed.ephemeral_secret, None);
    }

    #[test]
    fn rejects_foreign_signing_key() {
        let device = Keypair::generate();
        let other = Keypair::generate();
        let invite = Invite::create(device.public());
        assert!(invite.to_event(&other).is_err());
    }

    #[test]
    fn handshake_produces_converging_sessions() {
        let inviter_device = Keypair::generate();
        let invitee_device = Keypair::generate();
        let invitee_owner = Keypair::generate().public();

        let invite = Invite::create(inviter_device.public());
        let published = Invite::from_event(&invite.to_event(&inviter_device).unwrap()).unwrap();

        let (mut initiator, envelope) = published.accept(&invitee_device, invitee_owner).unwrap();
        let response = invite.process_response(&envelope, &inviter_device).unwrap();
        let mut responder = response.session;

        assert_eq!(response.invitee_identity, invitee_device.public());
        assert_eq!(response.owner, Some(invitee_owner));
        assert_eq!(initiator.name, envelope.id);
        assert_eq!(responder.name, envelope.id);

        let sent = initiator.send(&rumor("hello inviter")).unwrap();
        assert_eq!(responder.receive(&sent).unwrap().content, "hello inviter");
        let reply = responder.send(&rumor("hello invitee")).unwrap();
        assert_eq!(initiator.receive(&reply).unwrap().content, "hello invitee");
    }

    #[test]
    fn response_against_wrong_invite_is_rejected() {
        let inviter_device = Keypair::generate();
        let invitee_device = Keypair::generate();

        let invite = Invite::create(inviter_device.public());
        let unrelated = Invite::create(inviter_device.public());

        let (_session, envelope) = invite
            .accept(&invitee_device, Keypair::generate().public())
            .unwrap();
        assert!(unrelated
            .process_response(&envelope, &inviter_device)
            .is_err());
    }

    #[test]
    fn response_author_is_unlinkable() {
        let inviter_device = Keypair::generate();
        let invitee_device = Keypair::generate();

        let invite = Invite::create(inviter_device.public());
        let (_session, envelope) = invite
            .accept(&invitee_device, Keypair::generate().public())
            .unwrap();

        assert_ne!(envelope.pubkey, invitee_device.public());
        assert_eq!(
            envelope.tag_value("p"),
            Some(invite.ephemeral_public.to_hex().as_str())
        );
    }

    #[test]
    fn serde_roundtrip_retains_private_material() {
        let device = Keypair::generate();
        let invite = Invite::create(device.public());

        let json = serde_json::to_string(&invite).unwrap();
        let restored: Invite = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.ephemeral_secret, invite.ephemeral_secret);
        assert_eq!(restored.shared_secret, invite.shared_secret);
        assert_eq!(restored.inviter, invite.inviter);
    }
}
