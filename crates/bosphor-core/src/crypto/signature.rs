use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::fmt;

use crate::crypto::address::Address;
use crate::crypto::keys::{PublicKey, SecretKey};
use crate::error::CoreError;

/// Ed25519 signature carried together with the signer's public key.
///
/// Ed25519 offers no key recovery, so the key travels with the signature
/// and the signer's address is derived from it once the signature checks
/// out.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub public_key: PublicKey,
    #[serde(with = "BigArray")]
    pub bytes: [u8; 64],
}

impl Signature {
    /// Claimed signer, not yet verified
    pub fn signer(&self) -> Address {
        self.public_key.address()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signature({} by {})",
            hex::encode(&self.bytes[..8]),
            self.signer()
        )
    }
}

pub fn sign_message(secret_key: &SecretKey, message: &[u8]) -> Signature {
    Signature {
        public_key: secret_key.public_key(),
        bytes: secret_key.signing_key().sign(message).to_bytes(),
    }
}

/// Verify a bundled signature and return the signer's address
pub fn recover_signer(message: &[u8], signature: &Signature) -> Result<Address, CoreError> {
    signature.public_key.verify(message, &signature.bytes)?;
    Ok(signature.signer())
}
