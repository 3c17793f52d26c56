use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bosphor_consensus::{check_validator_signature, Backend, ConsensusError, ValidatorSet};
use bosphor_core::{sign_message, Address, Block, KeyPair, Signature};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::chain::{ChainError, MemoryChain};
use crate::network::{LocalNetwork, NetMessage};

/// Backend of one devnet validator: its key, its chain and its link to the
/// shared in-process network
pub struct NodeBackend {
    key: KeyPair,
    chain: RwLock<MemoryChain>,
    network: Arc<LocalNetwork>,
    head: watch::Sender<Block>,
}

impl NodeBackend {
    pub fn new(key: KeyPair, chain: MemoryChain, network: Arc<LocalNetwork>) -> Self {
        let (head, _) = watch::channel(chain.head().clone());
        NodeBackend {
            key,
            chain: RwLock::new(chain),
            network,
            head,
        }
    }

    fn chain(&self) -> RwLockReadGuard<'_, MemoryChain> {
        self.chain.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn chain_mut(&self) -> RwLockWriteGuard<'_, MemoryChain> {
        self.chain.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receiver notified whenever a block is appended
    pub fn subscribe_head(&self) -> watch::Receiver<Block> {
        self.head.subscribe()
    }

    pub fn head(&self) -> Block {
        self.chain().head().clone()
    }

    pub fn height(&self) -> u64 {
        self.chain().height()
    }

    pub fn block(&self, number: u64) -> Option<Block> {
        self.chain().block(number).cloned()
    }

    /// Build the next block on our head, proposed by us
    pub fn build_block(&self, payload: Vec<u8>) -> Block {
        self.chain().build_block(self.key.address(), unix_now(), payload)
    }

    /// Append a sealed block. Returns false if it was already known.
    pub fn import(&self, block: Block) -> Result<bool, ChainError> {
        let appended = self.chain_mut().commit(block.clone())?;
        if appended {
            self.head.send_replace(block);
        }
        Ok(appended)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl Backend<Block> for NodeBackend {
    fn address(&self) -> Address {
        self.key.address()
    }

    fn validators(&self, proposal: &Block) -> ValidatorSet {
        self.chain().validators_for(proposal.number())
    }

    fn send(&self, payload: Vec<u8>, target: Address) -> Result<(), ConsensusError> {
        self.network.send(&target, NetMessage::Consensus(payload))
    }

    fn broadcast(&self, validators: &ValidatorSet, payload: Vec<u8>) -> Result<(), ConsensusError> {
        self.gossip(validators, payload)
    }

    fn gossip(&self, validators: &ValidatorSet, payload: Vec<u8>) -> Result<(), ConsensusError> {
        let me = self.address();
        for target in validators.addresses() {
            if target == me {
                continue;
            }
            if let Err(e) = self.send(payload.clone(), target) {
                debug!("Gossip to {} failed: {}", target, e);
            }
        }
        Ok(())
    }

    fn commit(&self, proposal: &Block, seals: Vec<Signature>) -> Result<(), ConsensusError> {
        let sealed = proposal.with_seals(seals);
        if self.import(sealed.clone())? {
            info!(
                "Committed block {} ({}) with {} seals",
                sealed.number(),
                sealed.hash().short(),
                sealed.seals.len()
            );
            self.network.announce_block(&self.address(), &sealed);
        }
        Ok(())
    }

    fn verify(&self, proposal: &Block) -> Result<Duration, ConsensusError> {
        self.chain().verify(proposal)?;

        let now = unix_now();
        if proposal.header.timestamp > now {
            return Ok(Duration::from_secs(proposal.header.timestamp - now));
        }
        Ok(Duration::ZERO)
    }

    fn sign(&self, data: &[u8]) -> Result<Signature, ConsensusError> {
        Ok(sign_message(&self.key.secret, data))
    }

    fn check_validator_signature(
        &self,
        data: &[u8],
        signature: &Signature,
    ) -> Result<Address, ConsensusError> {
        let chain = self.chain();
        check_validator_signature(&chain.validators_for(chain.height()), data, signature)
    }

    fn last_proposal(&self) -> (Block, Address) {
        let head = self.head();
        let proposer = head.header.proposer;
        (head, proposer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosphor_consensus::{committed_seal_bytes, encode_validators, ProposerPolicy};
    use bosphor_core::GenesisConfig;

    fn setup(n: usize) -> (Vec<KeyPair>, Arc<LocalNetwork>, Vec<NodeBackend>) {
        let mut keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
        keys.sort_by_key(|k| k.address());
        let addresses: Vec<Address> = keys.iter().map(|k| k.address()).collect();
        let genesis = GenesisConfig {
            chain_id: 3,
            timestamp: 0,
            extra: encode_validators(&addresses),
        }
        .create_genesis_block();

        let network = Arc::new(LocalNetwork::new());
        let backends = keys
            .iter()
            .map(|key| {
                let chain =
                    MemoryChain::new(genesis.clone(), 100, 1, ProposerPolicy::RoundRobin).unwrap();
                NodeBackend::new(key.clone(), chain, Arc::clone(&network))
            })
            .collect();
        (keys, network, backends)
    }

    fn seals(keys: &[KeyPair], block: &Block) -> Vec<Signature> {
        keys.iter()
            .map(|k| sign_message(&k.secret, &committed_seal_bytes(&block.hash())))
            .collect()
    }

    #[tokio::test]
    async fn test_commit_updates_head_and_announces() {
        let (keys, network, backends) = setup(4);
        let mut peer_inbox = network.register(keys[1].address());
        let mut head_rx = backends[0].subscribe_head();

        let block = backends[0].build_block(b"tx".to_vec());
        backends[0].commit(&block, seals(&keys, &block)).unwrap();
        // Idempotent
        backends[0].commit(&block, seals(&keys, &block)).unwrap();

        assert_eq!(backends[0].height(), 1);
        head_rx.changed().await.unwrap();
        assert_eq!(head_rx.borrow().hash(), block.hash());

        match peer_inbox.recv().await {
            Some(NetMessage::Block(announced)) => {
                assert_eq!(announced.hash(), block.hash());
                assert!(backends[1].import(announced).unwrap());
            }
            other => panic!("expected block announcement, got {:?}", other),
        }
        assert!(peer_inbox.try_recv().is_err());
        assert_eq!(backends[1].head().hash(), block.hash());
    }

    #[test]
    fn test_commit_with_bad_seals_fails() {
        let (keys, _network, backends) = setup(4);
        let block = backends[0].build_block(vec![]);
        assert!(matches!(
            backends[0].commit(&block, seals(&keys[..2], &block)),
            Err(ConsensusError::InvalidCommittedSeals)
        ));
        assert_eq!(backends[0].height(), 0);
    }

    #[test]
    fn test_verify() {
        let (_keys, _network, backends) = setup(4);
        let block = backends[1].build_block(b"tx".to_vec());
        assert_eq!(backends[0].verify(&block).unwrap(), Duration::ZERO);

        let mut future = block.clone();
        future.header.timestamp = unix_now() + 30;
        let delay = backends[0].verify(&future).unwrap();
        assert!(delay > Duration::from_secs(20));

        let mut tampered = block;
        tampered.payload.push(0);
        assert!(matches!(
            backends[0].verify(&tampered),
            Err(ConsensusError::InvalidProposal(_))
        ));

        let (proposal, proposer) = backends[0].last_proposal();
        assert_eq!(proposal.number(), 0);
        assert_eq!(proposer, Address::ZERO);
    }

    #[test]
    fn test_validator_signatures() {
        let (keys, _network, backends) = setup(4);
        let signature = sign_message(&keys[2].secret, b"data");
        assert_eq!(
            backends[0]
                .check_validator_signature(b"data", &signature)
                .unwrap(),
            keys[2].address()
        );

        let outsider = KeyPair::generate();
        let signature = sign_message(&outsider.secret, b"data");
        assert!(matches!(
            backends[0].check_validator_signature(b"data", &signature),
            Err(ConsensusError::UnauthorizedAddress(_))
        ));
    }
}
