use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bosphor_core::{serialize, Block, CoreError};
use tracing::debug;

/// Opaque devnet transaction
pub type Tx = Vec<u8>;

/// FIFO pool of pending transactions shared by the devnet producers
pub struct TxPool {
    pending: Mutex<VecDeque<Tx>>,
    max_size: usize,
}

impl TxPool {
    pub fn new(max_size: usize) -> Self {
        TxPool {
            pending: Mutex::new(VecDeque::new()),
            max_size,
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Tx>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a transaction; returns false when the pool is full
    pub fn submit(&self, tx: Tx) -> bool {
        let mut pending = self.pending();
        if pending.len() >= self.max_size {
            return false;
        }
        pending.push_back(tx);
        true
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Oldest transactions, up to `max`, left in the pool until committed
    pub fn batch(&self, max: usize) -> Vec<Tx> {
        self.pending().iter().take(max).cloned().collect()
    }

    /// Drop the transactions carried by a committed block
    pub fn remove_committed(&self, block: &Block) {
        let included: HashSet<Tx> = match decode_payload(&block.payload) {
            Ok(txs) => txs.into_iter().collect(),
            Err(e) => {
                debug!("Block {} payload is not a tx batch: {}", block.number(), e);
                return;
            }
        };
        if included.is_empty() {
            return;
        }
        self.pending().retain(|tx| !included.contains(tx));
    }
}

/// Encode a batch as a block payload; an empty batch is an empty payload
pub fn encode_payload(txs: &[Tx]) -> Result<Vec<u8>, CoreError> {
    if txs.is_empty() {
        return Ok(Vec::new());
    }
    serialize::to_bytes(&txs)
}

pub fn decode_payload(payload: &[u8]) -> Result<Vec<Tx>, CoreError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    serialize::from_bytes(payload)
}
