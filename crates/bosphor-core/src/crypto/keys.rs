use ed25519_dalek::{Signature as DalekSignature, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::address::Address;
use crate::crypto::bytes::fixed_hex;
use crate::error::CoreError;

/// Ed25519 verifying key as raw bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        fixed_hex(s).map(PublicKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(self)
    }

    /// Check a raw Ed25519 signature over `message`
    pub fn verify(&self, message: &[u8], sig: &[u8; 64]) -> Result<(), CoreError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        key.verify(message, &DalekSignature::from_bytes(sig))
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Ed25519 signing key. Deliberately not `Serialize`; export goes through
/// `to_hex`.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    pub fn generate() -> Self {
        SecretKey(SigningKey::generate(&mut OsRng))
    }

    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        SecretKey(SigningKey::from_bytes(seed))
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        fixed_hex(s).map(|seed| Self::from_bytes(&seed))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Validator signing identity
#[derive(Clone)]
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        KeyPair { secret, public }
    }

    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    pub fn from_secret_bytes(seed: &[u8; 32]) -> Self {
        Self::from_secret(SecretKey::from_bytes(seed))
    }

    pub fn from_secret_hex(s: &str) -> Result<Self, CoreError> {
        SecretKey::from_hex(s).map(Self::from_secret)
    }

    pub fn address(&self) -> Address {
        self.public.address()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_determines_identity() {
        let a = KeyPair::from_secret_bytes(&[42u8; 32]);
        let b = KeyPair::from_secret_bytes(&[42u8; 32]);
        assert_eq!(a.public, b.public);
        assert_eq!(a.address(), b.address());
        assert_ne!(a.address(), KeyPair::from_secret_bytes(&[43u8; 32]).address());
    }

    #[test]
    fn test_hex_export_restores_keypair() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_hex(&kp.secret.to_hex()).unwrap();
        assert_eq!(restored.address(), kp.address());
        assert_eq!(PublicKey::from_hex(&kp.public.to_hex()).unwrap(), kp.public);

        assert!(matches!(
            KeyPair::from_secret_hex("abcd"),
            Err(CoreError::InvalidLength {
                expected: 32,
                got: 2
            })
        ));
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = KeyPair::generate();
        let shown = format!("{:?} {:?}", kp, kp.secret);
        assert!(!shown.contains(&kp.secret.to_hex()));
    }
}
