use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}
