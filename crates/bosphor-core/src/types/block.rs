use serde::{Deserialize, Serialize};

use crate::crypto::{hash_blake3, Address, Hash, Signature};

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Chain identifier
    pub chain_id: u64,
    /// Block number (0 for genesis)
    pub number: u64,
    /// Hash of the parent block (zeros for genesis)
    pub parent_hash: Hash,
    /// Unix timestamp in seconds
    pub timestamp: u64,
    /// Blake3 hash of the opaque payload
    pub payload_hash: Hash,
    /// Address of the validator that proposed the block
    pub proposer: Address,
    /// Validator set checkpoint (packed addresses) on epoch blocks, empty otherwise
    pub extra: Vec<u8>,
}

impl BlockHeader {
    /// Compute the hash of this header.
    ///
    /// Fields are fed to the hasher in declaration order with fixed-width
    /// integers and a length prefix on `extra`, so the digest is canonical
    /// without going through a serializer.
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.chain_id.to_be_bytes());
        hasher.update(&self.number.to_be_bytes());
        hasher.update(self.parent_hash.as_bytes());
        hasher.update(&self.timestamp.to_be_bytes());
        hasher.update(self.payload_hash.as_bytes());
        hasher.update(self.proposer.as_bytes());
        hasher.update(&(self.extra.len() as u64).to_be_bytes());
        hasher.update(&self.extra);
        Hash(*hasher.finalize().as_bytes())
    }
}

/// A complete block
///
/// Committed seals are not part of the header hash: they are collected after
/// the hash has been agreed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub payload: Vec<u8>,
    pub seals: Vec<Signature>,
}

impl Block {
    /// Create a new unsealed block
    pub fn new(header: BlockHeader, payload: Vec<u8>) -> Self {
        Block {
            header,
            payload,
            seals: Vec::new(),
        }
    }

    /// Build the next block on top of `parent`
    pub fn child(
        parent: &Block,
        timestamp: u64,
        proposer: Address,
        payload: Vec<u8>,
        extra: Vec<u8>,
    ) -> Self {
        let header = BlockHeader {
            chain_id: parent.header.chain_id,
            number: parent.header.number + 1,
            parent_hash: parent.hash(),
            timestamp,
            payload_hash: hash_blake3(&payload),
            proposer,
            extra,
        };
        Block::new(header, payload)
    }

    /// Compute the block hash (hash of header)
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Check that `payload_hash` matches the payload
    pub fn verify_payload_hash(&self) -> bool {
        hash_blake3(&self.payload) == self.header.payload_hash
    }

    /// Return a copy of this block carrying the given committed seals
    pub fn with_seals(&self, seals: Vec<Signature>) -> Block {
        Block {
            header: self.header.clone(),
            payload: self.payload.clone(),
            seals,
        }
    }
}

/// Genesis block configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: u64,
    pub timestamp: u64,
    /// Packed validator addresses for the first epoch
    pub extra: Vec<u8>,
}

impl GenesisConfig {
    /// Create a genesis block from this config
    pub fn create_genesis_block(&self) -> Block {
        let header = BlockHeader {
            chain_id: self.chain_id,
            number: 0,
            parent_hash: Hash::ZERO,
            timestamp: self.timestamp,
            payload_hash: hash_blake3(&[]),
            proposer: Address::ZERO,
            extra: self.extra.clone(),
        };

        Block::new(header, Vec::new())
    }
}
