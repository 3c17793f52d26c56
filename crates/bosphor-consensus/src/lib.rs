//! Bosphor Consensus - Istanbul BFT block consensus
//!
//! This crate provides the validator set and proposer rotation, the signed
//! consensus message codec, per-round message collection, the consensus
//! state machine and the actor that drives it from a single event queue.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod message;
pub mod message_set;
pub mod round_state;
pub mod state_machine;
pub mod validator;

pub use backend::{verify_committed_seals, Backend, Proposal};
pub use config::{Config, ProposerPolicy};
pub use engine::{Engine, EngineHandle};
pub use error::ConsensusError;
pub use events::{Effect, Event};
pub use message::{committed_seal_bytes, Message, MessageCode, Preprepare, Subject, View};
pub use message_set::MessageSet;
pub use round_state::RoundState;
pub use state_machine::{Core, State};
pub use validator::{
    check_validator_signature, encode_validators, extract_validators, is_checkpoint, Validator,
    ValidatorSet,
};
