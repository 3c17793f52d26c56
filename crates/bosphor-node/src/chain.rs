use std::collections::BTreeMap;

use bosphor_consensus::{
    encode_validators, extract_validators, is_checkpoint, verify_committed_seals, ConsensusError,
    ProposerPolicy, ValidatorSet,
};
use bosphor_core::{Address, Block, Hash};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Block {got} does not extend head {head}")]
    NotNext { head: u64, got: u64 },

    #[error("Unknown parent {0}")]
    UnknownParent(Hash),

    #[error("Chain id {got} does not match {expected}")]
    WrongChain { expected: u64, got: u64 },

    #[error("Payload hash mismatch")]
    PayloadHash,

    #[error("Timestamp {got} is earlier than {min}")]
    Timestamp { min: u64, got: u64 },

    #[error("Invalid extra data: {0}")]
    InvalidExtra(String),

    #[error("Conflicting block at height {0}")]
    Conflict(u64),

    #[error("Seal verification failed: {0}")]
    Seals(ConsensusError),
}

impl From<ChainError> for ConsensusError {
    fn from(error: ChainError) -> Self {
        match error {
            ChainError::Seals(_) => ConsensusError::InvalidCommittedSeals,
            other => ConsensusError::InvalidProposal(other.to_string()),
        }
    }
}

/// Change to the validator set applied at the next checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorChange {
    Add(Address),
    Remove(Address),
}

/// In-memory block store seeded from a genesis block.
///
/// Checkpoint blocks (numbers divisible by the epoch) carry the packed
/// validator set that applies to every block after them.
pub struct MemoryChain {
    blocks: Vec<Block>,
    epoch: u64,
    block_period: u64,
    genesis_validators: ValidatorSet,
    checkpoints: BTreeMap<u64, ValidatorSet>,
    pending_changes: Vec<ValidatorChange>,
}

impl MemoryChain {
    pub fn new(
        genesis: Block,
        epoch: u64,
        block_period: u64,
        policy: ProposerPolicy,
    ) -> Result<Self, ChainError> {
        let validators = parse_validator_extra(&genesis.header.extra, policy)?;
        info!(
            "Genesis {} with {} validators",
            genesis.hash().short(),
            validators.size()
        );

        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(0, validators.clone());
        Ok(MemoryChain {
            blocks: vec![genesis],
            epoch,
            block_period,
            genesis_validators: validators,
            checkpoints,
            pending_changes: Vec::new(),
        })
    }

    pub fn head(&self) -> &Block {
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn height(&self) -> u64 {
        self.head().number()
    }

    pub fn block(&self, number: u64) -> Option<&Block> {
        self.blocks.get(number as usize)
    }

    /// Validator set in force for the block after `number`: the one stored
    /// in the latest checkpoint at or below it
    pub fn validators_for(&self, number: u64) -> ValidatorSet {
        self.checkpoints
            .range(..=number)
            .next_back()
            .map(|(_, set)| set.clone())
            .unwrap_or_else(|| self.genesis_validators.clone())
    }

    /// Queue a membership change for the next checkpoint
    pub fn propose_change(&mut self, change: ValidatorChange) {
        debug!("Queued validator change {:?}", change);
        self.pending_changes.push(change);
    }

    /// Extra field for block `number`: the next validator set on
    /// checkpoints, empty otherwise
    pub fn checkpoint_extra(&self, number: u64) -> Vec<u8> {
        if !is_checkpoint(number, self.epoch) {
            return Vec::new();
        }
        let mut set = self.validators_for(number.saturating_sub(1));
        for change in &self.pending_changes {
            match change {
                ValidatorChange::Add(address) => set.add_validator(*address),
                ValidatorChange::Remove(address) => set.remove_validator(address),
            };
        }
        encode_validators(&set.addresses())
    }

    /// Build the next block on the head
    pub fn build_block(&self, proposer: Address, timestamp: u64, payload: Vec<u8>) -> Block {
        let head = self.head();
        let timestamp = timestamp.max(head.header.timestamp + self.block_period);
        Block::child(
            head,
            timestamp,
            proposer,
            payload,
            self.checkpoint_extra(head.number() + 1),
        )
    }

    /// Check that `block` can extend the head
    pub fn verify(&self, block: &Block) -> Result<(), ChainError> {
        let head = self.head();
        if block.number() != head.number() + 1 {
            return Err(ChainError::NotNext {
                head: head.number(),
                got: block.number(),
            });
        }
        if block.header.parent_hash != head.hash() {
            return Err(ChainError::UnknownParent(block.header.parent_hash));
        }
        if block.header.chain_id != head.header.chain_id {
            return Err(ChainError::WrongChain {
                expected: head.header.chain_id,
                got: block.header.chain_id,
            });
        }
        if !block.verify_payload_hash() {
            return Err(ChainError::PayloadHash);
        }
        let min = head.header.timestamp + self.block_period;
        if block.header.timestamp < min {
            return Err(ChainError::Timestamp {
                min,
                got: block.header.timestamp,
            });
        }

        if is_checkpoint(block.number(), self.epoch) {
            let policy = self.genesis_validators.policy();
            let set = parse_validator_extra(&block.header.extra, policy)?;
            if block.header.extra != self.checkpoint_extra(block.number()) {
                return Err(ChainError::InvalidExtra(format!(
                    "checkpoint {} does not carry the scheduled validator set",
                    block.number()
                )));
            }
            debug!("Checkpoint {} carries {} validators", block.number(), set.size());
        } else if !block.header.extra.is_empty() {
            return Err(ChainError::InvalidExtra(
                "validator list outside a checkpoint".to_string(),
            ));
        }
        Ok(())
    }

    /// Append a sealed block. Returns false when the same block is already
    /// stored.
    pub fn commit(&mut self, block: Block) -> Result<bool, ChainError> {
        if let Some(existing) = self.block(block.number()) {
            if existing.hash() == block.hash() {
                return Ok(false);
            }
            return Err(ChainError::Conflict(block.number()));
        }

        self.verify(&block)?;
        let validators = self.validators_for(block.number() - 1);
        verify_committed_seals(&block.hash(), &block.seals, &validators)
            .map_err(ChainError::Seals)?;

        if is_checkpoint(block.number(), self.epoch) {
            let set = parse_validator_extra(&block.header.extra, validators.policy())?;
            info!(
                "Checkpoint {} switches to {} validators",
                block.number(),
                set.size()
            );
            self.checkpoints.insert(block.number(), set);
            self.pending_changes.clear();
        }

        debug!(
            "Appended block {} ({})",
            block.number(),
            block.hash().short()
        );
        self.blocks.push(block);
        Ok(true)
    }
}

fn parse_validator_extra(extra: &[u8], policy: ProposerPolicy) -> Result<ValidatorSet, ChainError> {
    let addresses =
        extract_validators(extra).map_err(|e| ChainError::InvalidExtra(e.to_string()))?;
    if addresses.is_empty() {
        return Err(ChainError::InvalidExtra("empty validator set".to_string()));
    }
    ValidatorSet::new(addresses, policy).map_err(|e| ChainError::InvalidExtra(e.to_string()))
}
