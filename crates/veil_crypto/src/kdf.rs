//! Key derivation functions.
//!
//! `kdf` — the ratchet chain KDF: HKDF-SHA256 expanded with single-byte
//!   infos `1..=n`, yielding n independent 32-byte outputs. Used for both
//!   root-key mixes (salt = root key, ikm = DH output) and symmetric chain
//!   steps (salt = chain key, ikm = a constant byte).
//!
//! `message_seal` — splits a one-shot message key into the AEAD key and
//!   nonce that encrypt a single message body.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Ratchet chain KDF: derive `n` 32-byte outputs from `(salt, ikm)`.
///
/// Output `i` (0-based) is the HKDF expansion with the single info byte
/// `i + 1`, so outputs are pairwise independent.
pub fn kdf(salt: &[u8], ikm: &[u8], n: u8) -> Result<Vec<[u8; 32]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut outputs = Vec::with_capacity(n as usize);
    for i in 1..=n {
        let mut out = [0u8; 32];
        hk.expand(&[i], &mut out)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        outputs.push(out);
    }
    Ok(outputs)
}

/// Split a message key into the (key, nonce) pair that seals one body.
pub fn message_seal(message_key: &[u8; 32]) -> Result<([u8; 32], [u8; 12]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, message_key);
    let mut key = [0u8; 32];
    let mut nonce = [0u8; 12];
    hk.expand(b"key", &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"nonce", &mut nonce)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((key, nonce))
}
