use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use bosphor_consensus::ConsensusError;
use bosphor_core::{Address, Block};
use tokio::sync::mpsc;
use tracing::debug;

/// Traffic carried between devnet peers
#[derive(Debug, Clone)]
pub enum NetMessage {
    /// Encoded consensus message
    Consensus(Vec<u8>),
    /// Sealed block announced after commit
    Block(Block),
}

/// In-process transport connecting the validators of a devnet
#[derive(Default)]
pub struct LocalNetwork {
    peers: RwLock<HashMap<Address, mpsc::UnboundedSender<NetMessage>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer and return its inbox. Re-registering replaces the old
    /// inbox.
    pub fn register(&self, address: Address) -> mpsc::UnboundedReceiver<NetMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, tx);
        rx
    }

    pub fn disconnect(&self, address: &Address) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    pub fn peer_count(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn send(&self, target: &Address, message: NetMessage) -> Result<(), ConsensusError> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let tx = peers
            .get(target)
            .ok_or_else(|| ConsensusError::Transport(format!("unknown peer {}", target)))?;
        tx.send(message)
            .map_err(|_| ConsensusError::Transport(format!("peer {} is gone", target)))
    }

    /// Announce a sealed block to every peer except `from`
    pub fn announce_block(&self, from: &Address, block: &Block) {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        for (address, tx) in peers.iter() {
            if address == from {
                continue;
            }
            if tx.send(NetMessage::Block(block.clone())).is_err() {
                debug!("Peer {} dropped block {}", address, block.number());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosphor_core::{GenesisConfig, KeyPair};

    #[tokio::test]
    async fn test_send_reaches_registered_peer() {
        let network = LocalNetwork::new();
        let peer = KeyPair::generate().address();
        let mut inbox = network.register(peer);

        network.send(&peer, NetMessage::Consensus(vec![1, 2])).unwrap();
        match inbox.recv().await {
            Some(NetMessage::Consensus(payload)) => assert_eq!(payload, vec![1, 2]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_send_to_unknown_peer_fails() {
        let network = LocalNetwork::new();
        let peer = KeyPair::generate().address();
        assert!(matches!(
            network.send(&peer, NetMessage::Consensus(vec![])),
            Err(ConsensusError::Transport(_))
        ));

        let inbox = network.register(peer);
        drop(inbox);
        assert!(network.send(&peer, NetMessage::Consensus(vec![])).is_err());

        network.disconnect(&peer);
        assert_eq!(network.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_announce_skips_sender() {
        let network = LocalNetwork::new();
        let a = KeyPair::generate().address();
        let b = KeyPair::generate().address();
        let mut inbox_a = network.register(a);
        let mut inbox_b = network.register(b);

        let block = GenesisConfig {
            chain_id: 1,
            timestamp: 0,
            extra: vec![],
        }
        .create_genesis_block();
        network.announce_block(&a, &block);

        assert!(matches!(inbox_b.recv().await, Some(NetMessage::Block(_))));
        assert!(inbox_a.try_recv().is_err());
    }
}
