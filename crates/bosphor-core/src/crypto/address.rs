use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::bytes::{fixed, fixed_hex};
use crate::crypto::hash::hash_blake3;
use crate::crypto::keys::PublicKey;
use crate::error::CoreError;

/// Width of a validator address in bytes
pub const ADDRESS_LENGTH: usize = 20;

/// Validator identity: trailing 20 bytes of the Blake3 hash of a public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_LENGTH]);

    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = hash_blake3(public_key.as_bytes());
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes.copy_from_slice(&digest.as_bytes()[32 - ADDRESS_LENGTH..]);
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Address::ZERO
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CoreError> {
        fixed(slice).map(Address)
    }

    /// Parse hex with or without the `0x` prefix
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        fixed_hex(s).map(Address)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}
