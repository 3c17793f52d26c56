use std::fmt;

use bosphor_core::{serialize, Address, Hash, Signature};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConsensusError;

/// Consensus message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageCode {
    Preprepare = 0,
    Prepare = 1,
    Commit = 2,
    RoundChange = 3,
}

/// A consensus instance: block height plus the attempt number at that height.
///
/// Field order gives the derived ordering: sequence first, then round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct View {
    pub sequence: u64,
    pub round: u64,
}

impl View {
    pub fn new(sequence: u64, round: u64) -> Self {
        View { sequence, round }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sequence, self.round)
    }
}

/// Payload of Prepare, Commit and RoundChange messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub view: View,
    pub digest: Hash,
}

/// Payload of a Preprepare message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preprepare<P> {
    pub view: View,
    pub proposal: P,
}

/// Signed consensus message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub code: MessageCode,
    pub view: View,
    pub payload: Vec<u8>,
    pub address: Address,
    pub signature: Option<Signature>,
    /// Seal over the proposal hash, carried by Commit messages only
    pub committed_seal: Option<Signature>,
}

impl Message {
    pub fn new(code: MessageCode, view: View, payload: Vec<u8>, address: Address) -> Self {
        Message {
            code,
            view,
            payload,
            address,
            signature: None,
            committed_seal: None,
        }
    }

    /// Build an unsigned Prepare, Commit or RoundChange message
    pub fn with_subject(
        code: MessageCode,
        subject: &Subject,
        address: Address,
    ) -> Result<Self, ConsensusError> {
        Ok(Message::new(
            code,
            subject.view,
            serialize::to_bytes(subject)?,
            address,
        ))
    }

    /// Build an unsigned Preprepare message
    pub fn with_preprepare<P: Serialize>(
        preprepare: &Preprepare<P>,
        address: Address,
    ) -> Result<Self, ConsensusError> {
        Ok(Message::new(
            MessageCode::Preprepare,
            preprepare.view,
            serialize::to_bytes(preprepare)?,
            address,
        ))
    }

    /// Bytes covered by the envelope signature: the message with the
    /// signature cleared
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ConsensusError> {
        let unsigned = Message {
            signature: None,
            ..self.clone()
        };
        Ok(serialize::to_bytes(&unsigned)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ConsensusError> {
        Ok(serialize::to_bytes(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConsensusError> {
        serialize::from_bytes(bytes).map_err(|e| ConsensusError::InvalidMessage(e.to_string()))
    }

    /// Decode the subject and check it targets the envelope's view
    pub fn subject(&self) -> Result<Subject, ConsensusError> {
        if self.code == MessageCode::Preprepare {
            return Err(ConsensusError::InvalidMessage(
                "preprepare carries no subject".to_string(),
            ));
        }
        let subject: Subject = serialize::from_bytes(&self.payload)
            .map_err(|e| ConsensusError::InvalidMessage(e.to_string()))?;
        if subject.view != self.view {
            return Err(ConsensusError::InvalidMessage(format!(
                "subject view {} differs from envelope view {}",
                subject.view, self.view
            )));
        }
        Ok(subject)
    }

    /// Decode the preprepare and check it targets the envelope's view
    pub fn preprepare<P: DeserializeOwned>(&self) -> Result<Preprepare<P>, ConsensusError> {
        if self.code != MessageCode::Preprepare {
            return Err(ConsensusError::InvalidMessage(format!(
                "{:?} carries no proposal",
                self.code
            )));
        }
        let preprepare: Preprepare<P> = serialize::from_bytes(&self.payload)
            .map_err(|e| ConsensusError::InvalidMessage(e.to_string()))?;
        if preprepare.view != self.view {
            return Err(ConsensusError::InvalidMessage(format!(
                "preprepare view {} differs from envelope view {}",
                preprepare.view, self.view
            )));
        }
        Ok(preprepare)
    }
}

/// Bytes a validator signs to seal a committed proposal: the hash followed
/// by the Commit code
pub fn committed_seal_bytes(hash: &Hash) -> Vec<u8> {
    let mut data = Vec::with_capacity(33);
    data.extend_from_slice(hash.as_bytes());
    data.push(MessageCode::Commit as u8);
    data
}
