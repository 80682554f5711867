//! Ed25519 key material.
//!
//! Every protocol key in Veil is an Ed25519 keypair: the owner identity,
//! each device identity, invite ephemerals, and the per-session ratchet
//! keys. The public key is the address on the transport; DH uses the
//! X25519 conversion in [`crate::dh`].

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── Public key ───────────────────────────────────────────────────────────────

/// 32-byte Ed25519 public key, hex-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".into()))?;
        Ok(Self(arr))
    }

    /// Verify a 64-byte Ed25519 signature over `msg`.
    pub fn verify(&self, msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_slice(sig_bytes)
            .map_err(|_| CryptoError::InvalidKey("signature must be 64 bytes".into()))?;
        vk.verify(msg, &sig)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── Keypair ──────────────────────────────────────────────────────────────────

/// Ed25519 keypair. Move-only; the secret half is zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct Keypair {
    #[zeroize(skip)]
    public: PublicKey,
    secret: [u8; 32],
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("secret key must be 32 bytes".into()))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&arr)))
    }

    pub fn from_secret_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s)?;
        Self::from_secret_bytes(&bytes)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public = PublicKey(signing_key.verifying_key().to_bytes());
        Self {
            public,
            secret: signing_key.to_bytes(),
        }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Sign arbitrary bytes; returns the raw 64-byte Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.secret).sign(msg).to_bytes()
    }
}

/// Signing capability at the identity seam: a local keypair, or an
/// external holder of the key (hardware, remote signer) supplied by the
/// embedding application.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;
    fn sign(&self, msg: &[u8]) -> [u8; 64];
}

impl Signer for Keypair {
    fn public_key(&self) -> PublicKey {
        self.public
    }

    fn sign(&self, msg: &[u8]) -> [u8; 64] {
        Keypair::sign(self, msg)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hello");
        kp.public().verify(b"hello", &sig).unwrap();
    }

    #[test]
    fn rejects_wrong_message() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hello");
        assert!(kp.public().verify(b"goodbye", &sig).is_err());
    }

    #[test]
    fn rejects_wrong_key() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let sig = kp.sign(b"hello");
        assert!(other.public().verify(b"hello", &sig).is_err());
    }

    #[test]
    fn hex_roundtrip() {
        let kp = Keypair::generate();
        let restored = PublicKey::from_hex(&kp.public().to_hex()).unwrap();
        assert_eq!(kp.public(), restored);
    }

    #[test]
    fn secret_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_bytes(kp.secret_bytes()).unwrap();
        assert_eq!(kp.public(), restored.public());
    }
}
