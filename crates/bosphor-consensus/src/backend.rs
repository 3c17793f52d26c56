use std::collections::HashSet;
use std::fmt::Debug;
use std::time::Duration;

use bosphor_core::{recover_signer, Address, Block, Hash, Signature};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ConsensusError;
use crate::message::committed_seal_bytes;
use crate::validator::ValidatorSet;

/// A candidate block as seen by consensus
pub trait Proposal: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Height the proposal would occupy
    fn number(&self) -> u64;

    /// Identity that validators vote on
    fn hash(&self) -> Hash;

    fn parent_hash(&self) -> Hash;
}

impl Proposal for Block {
    fn number(&self) -> u64 {
        self.header.number
    }

    fn hash(&self) -> Hash {
        self.header.hash()
    }

    fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }
}

/// Everything the consensus core needs from its host: chain access,
/// proposal verification, networking and signing.
///
/// Network methods are best-effort: an error is reported back for logging
/// but never blocks consensus progress.
pub trait Backend<P: Proposal>: Send + Sync + 'static {
    /// Address of the local validator
    fn address(&self) -> Address;

    /// Validator set for the sequence following `proposal`
    fn validators(&self, proposal: &P) -> ValidatorSet;

    /// Send an encoded message to one validator
    fn send(&self, payload: Vec<u8>, target: Address) -> Result<(), ConsensusError>;

    /// Send an encoded message to every validator except ourselves
    fn broadcast(&self, validators: &ValidatorSet, payload: Vec<u8>)
        -> Result<(), ConsensusError>;

    /// Relay an encoded message to the validators we are connected to
    fn gossip(&self, validators: &ValidatorSet, payload: Vec<u8>) -> Result<(), ConsensusError>;

    /// Finalize `proposal` with the committed seals collected at quorum.
    /// Must be idempotent for the same proposal.
    fn commit(&self, proposal: &P, seals: Vec<Signature>) -> Result<(), ConsensusError>;

    /// Validate proposal content; the returned delay asks the engine to wait
    /// before accepting it
    fn verify(&self, proposal: &P) -> Result<Duration, ConsensusError>;

    fn sign(&self, data: &[u8]) -> Result<Signature, ConsensusError>;

    /// Check that `signature` over `data` was made by `address`
    fn check_signature(
        &self,
        data: &[u8],
        address: &Address,
        signature: &Signature,
    ) -> Result<(), ConsensusError> {
        let signer =
            recover_signer(data, signature).map_err(|_| ConsensusError::InvalidSignature)?;
        if signer != *address {
            return Err(ConsensusError::InvalidSignature);
        }
        Ok(())
    }

    /// Recover the validator that signed `data`
    fn check_validator_signature(
        &self,
        data: &[u8],
        signature: &Signature,
    ) -> Result<Address, ConsensusError>;

    /// Latest finalized proposal and the address that proposed it
    fn last_proposal(&self) -> (P, Address);
}

/// Check the committed seals of `hash` against `validators`.
///
/// Every seal must come from a distinct member and there must be at least a
/// quorum of them.
pub fn verify_committed_seals(
    hash: &Hash,
    seals: &[Signature],
    validators: &ValidatorSet,
) -> Result<(), ConsensusError> {
    if seals.len() < validators.quorum_size() {
        return Err(ConsensusError::InvalidCommittedSeals);
    }

    let data = committed_seal_bytes(hash);
    let mut signers = HashSet::with_capacity(seals.len());
    for seal in seals {
        let signer =
            recover_signer(&data, seal).map_err(|_| ConsensusError::InvalidCommittedSeals)?;
        if !validators.contains(&signer) || !signers.insert(signer) {
            return Err(ConsensusError::InvalidCommittedSeals);
        }
    }

    Ok(())
}
