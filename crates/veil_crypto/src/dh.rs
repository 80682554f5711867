//! Diffie-Hellman over X25519, reached from Ed25519 protocol keys.
//!
//! References:
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 8032 (Ed25519): <https://datatracker.ietf.org/doc/html/rfc8032>
//!
//! Veil keys sign events (Ed25519) and feed key agreement (X25519). The
//! secret conversion uses the clamped SHA-512 expansion that ed25519-dalek
//! applies internally; the public conversion is the birational map from
//! the Edwards curve to Curve25519.
//!
//! A *conversation key* is the symmetric 32-byte key shared by two
//! parties: `conversation_key(a, B) == conversation_key(b, A)`.

use curve25519_dalek::edwards::CompressedEdwardsY;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{error::CryptoError, kdf, keys::PublicKey};

/// Convert an Ed25519 secret (32 bytes) to an X25519 static secret.
/// Clamped per RFC 7748 §5, mirroring libsignal's IK → X25519 conversion.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    let mut h = Sha512::digest(ed_secret);
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 public key to an X25519 public key via the
/// Edwards → Montgomery map.
pub fn ed25519_public_to_x25519(ed_public: &PublicKey) -> Result<X25519Public, CryptoError> {
    let compressed = CompressedEdwardsY::from_slice(ed_public.as_bytes())
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("Ed25519 public key decompression failed".into()))?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

/// Derive the symmetric conversation key between `our_secret` and
/// `their_public`: HKDF-SHA256 over the raw X25519 shared point.
///
/// Rejects all-zero shared secrets (small-order peer points).
pub fn conversation_key(
    our_secret: &[u8; 32],
    their_public: &PublicKey,
) -> Result<[u8; 32], CryptoError> {
    let sk = ed25519_secret_to_x25519(our_secret);
    let pk = ed25519_public_to_x25519(their_public)?;
    let shared = sk.diffie_hellman(&pk);
    if shared.as_bytes().iter().all(|&b| b == 0) {
        return Err(CryptoError::InvalidKey("low-order DH public key".into()));
    }
    let mut out = [0u8; 32];
    kdf::hkdf_expand(shared.as_bytes(), Some(b"veil/conv/v1"), b"conversation", &mut out)?;
    Ok(out)
}
