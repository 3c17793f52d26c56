mod bytes;

pub mod address;
pub mod hash;
pub mod keys;
pub mod signature;

pub use address::{Address, ADDRESS_LENGTH};
pub use hash::{hash_blake3, Hash};
pub use keys::{KeyPair, PublicKey, SecretKey};
pub use signature::{recover_signer, sign_message, Signature};
