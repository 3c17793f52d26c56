use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::bytes::fixed_hex;
use crate::error::CoreError;

/// Blake3 digest identifying blocks and vote subjects
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        fixed_hex(s).map(Hash)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Leading four bytes, enough to tell proposals apart in logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

pub fn hash_blake3(data: &[u8]) -> Hash {
    Hash(blake3::hash(data).into())
}
