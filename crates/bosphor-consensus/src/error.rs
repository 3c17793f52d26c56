use bosphor_core::{Address, Hash};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Unauthorized address: {0}")]
    UnauthorizedAddress(Address),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Message view is older than the current view")]
    OldMessage,

    #[error("Message view is ahead of the current view")]
    FutureMessage,

    #[error("Message not from the proposer")]
    NotFromProposer,

    #[error("Proposal conflicts with locked hash {0}")]
    LockedProposal(Hash),

    #[error("Message subject does not match the current proposal")]
    InconsistentSubject,

    #[error("Invalid committed seals")]
    InvalidCommittedSeals,

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid extra data: length {0} is not a multiple of the address width")]
    InvalidExtraData(usize),

    #[error("Duplicate validator: {0}")]
    DuplicateValidator(Address),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Engine is stopped")]
    EngineStopped,

    #[error("Core error: {0}")]
    Core(#[from] bosphor_core::CoreError),
}

impl ConsensusError {
    /// Stale and future-view drops are routine and only worth a debug line
    pub fn is_informational(&self) -> bool {
        matches!(self, ConsensusError::OldMessage | ConsensusError::FutureMessage)
    }
}
