//! veil_crypto — cryptographic primitives for Veil Secure Messaging
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Public APIs take and return fixed-size arrays or opaque newtypes.
//!
//! # Module layout
//! - `keys`  — Ed25519 keypairs (identity, device, ratchet) + hex pubkey newtype
//! - `dh`    — Ed25519→X25519 conversion and conversation-key derivation
//! - `kdf`   — HKDF-SHA256 chain KDF and message-key splitting
//! - `aead`  — ChaCha20-Poly1305 encrypt/decrypt helpers
//! - `error` — unified error type

pub mod aead;
pub mod dh;
pub mod error;
pub mod kdf;
pub mod keys;

pub use error::CryptoError;
pub use keys::{Keypair, PublicKey, Signer};
