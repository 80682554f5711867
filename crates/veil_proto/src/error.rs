use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Event id mismatch")]
    IdMismatch,

    #[error("Crypto error: {0}")]
    Crypto(#[from] veil_crypto::CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}
