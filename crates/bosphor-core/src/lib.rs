//! Bosphor Core - Core types, cryptography, and serialization
//!
//! This crate provides the foundational types shared by the consensus
//! engine and the node: hashes, validator addresses, Ed25519 keys and
//! signatures, deterministic encoding, and the block type that flows
//! through consensus as a proposal.

pub mod crypto;
pub mod error;
pub mod serialize;
pub mod types;

pub use crypto::{
    hash_blake3, recover_signer, sign_message, Address, Hash, KeyPair, PublicKey, SecretKey,
    Signature, ADDRESS_LENGTH,
};
pub use error::CoreError;
pub use types::*;
