use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Deterministic bincode encoding used on the wire and for signing
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    bincode::serialize(value).map_err(|e| CoreError::Encode(e.to_string()))
}

pub fn from_bytes<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CoreError> {
    bincode::deserialize(bytes).map_err(|e| CoreError::Decode(e.to_string()))
}
