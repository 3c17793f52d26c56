use std::collections::BTreeMap;

use bosphor_core::Address;
use tracing::debug;

use crate::error::ConsensusError;
use crate::message::Message;
use crate::validator::ValidatorSet;

/// Messages of one (view, code) bucket, at most one per validator.
///
/// Entries are keyed by validator index so iteration follows the order of
/// the validator set.
#[derive(Debug, Clone)]
pub struct MessageSet {
    validators: ValidatorSet,
    messages: BTreeMap<usize, Message>,
}

impl MessageSet {
    pub fn new(validators: ValidatorSet) -> Self {
        MessageSet {
            validators,
            messages: BTreeMap::new(),
        }
    }

    /// Insert a message, replacing any earlier one from the same sender
    pub fn add(&mut self, message: Message) -> Result<(), ConsensusError> {
        let (index, _) = self
            .validators
            .get_by_address(&message.address)
            .ok_or(ConsensusError::UnauthorizedAddress(message.address))?;

        if self.messages.insert(index, message).is_some() {
            debug!("Replaced message from validator {}", index);
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages in ascending validator index
    pub fn values(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    pub fn get(&self, address: &Address) -> Option<&Message> {
        let (index, _) = self.validators.get_by_address(address)?;
        self.messages.get(&index)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.get(address).is_some()
    }

    /// Keep only the messages matching `keep`
    pub fn retain(&mut self, mut keep: impl FnMut(&Message) -> bool) {
        self.messages.retain(|_, message| keep(message));
    }

    pub fn has_quorum(&self) -> bool {
        self.size() >= self.validators.quorum_size()
    }
}
