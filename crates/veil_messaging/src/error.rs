use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The session cannot perform the requested operation yet (e.g. a
    /// responder sending before its first receive).
    #[error("Session not ready")]
    SessionNotReady,

    /// The envelope could not be decrypted against this session. Dropped
    /// at the session boundary; state is unchanged.
    #[error("Undecryptable envelope: {0}")]
    Undecryptable(&'static str),

    /// A header counter jumped past MAX_SKIP.
    #[error("Skipped message keys exhausted")]
    SkippedKeysExhausted,

    /// An invite response from a device the claimed owner never
    /// authorized.
    #[error("Unauthorized device: {0}")]
    Unauthorized(String),

    #[error("Malformed invite: {0}")]
    Invite(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Not initialized")]
    NotInitialized,

    #[error("Crypto error: {0}")]
    Crypto(#[from] veil_crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Proto(#[from] veil_proto::ProtoError),

    #[error("Storage error: {0}")]
    Storage(#[from] veil_store::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
