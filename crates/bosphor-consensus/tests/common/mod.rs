//! Synchronous multi-validator harness for consensus tests.
//!
//! Every validator runs a real `Core` over a `TestBackend`. Outbound messages
//! land in one shared FIFO queue and are delivered one at a time, so a test
//! fully controls ordering, loss and timer expiry.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bosphor_consensus::{
    check_validator_signature, encode_validators, verify_committed_seals, Backend, Config,
    ConsensusError, Core, Effect, Message, MessageCode, Preprepare, ProposerPolicy, Subject,
    ValidatorSet, View,
};
use bosphor_core::{sign_message, Address, Block, GenesisConfig, Hash, KeyPair, Signature};

pub struct Envelope {
    pub from: Address,
    pub to: Address,
    pub payload: Vec<u8>,
}

pub type Network = Arc<Mutex<VecDeque<Envelope>>>;

/// In-memory chain and loopback network for one validator
pub struct TestBackend {
    key: KeyPair,
    validators: Vec<Address>,
    policy: ProposerPolicy,
    network: Network,
    chain: Mutex<Vec<Block>>,
    rejected: Mutex<HashSet<Hash>>,
    sent: Mutex<Vec<Message>>,
    commit_failures: Mutex<usize>,
    head_moved: Mutex<bool>,
}

impl TestBackend {
    pub fn new(
        key: KeyPair,
        validators: Vec<Address>,
        policy: ProposerPolicy,
        genesis: Block,
        network: Network,
    ) -> Self {
        TestBackend {
            key,
            validators,
            policy,
            network,
            chain: Mutex::new(vec![genesis]),
            rejected: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            commit_failures: Mutex::new(0),
            head_moved: Mutex::new(false),
        }
    }

    pub fn head(&self) -> Block {
        self.chain.lock().unwrap().last().cloned().unwrap()
    }

    pub fn height(&self) -> u64 {
        self.head().number()
    }

    pub fn block_at(&self, number: u64) -> Option<Block> {
        self.chain.lock().unwrap().get(number as usize).cloned()
    }

    /// Make `verify` fail for this proposal
    pub fn reject(&self, hash: Hash) {
        self.rejected.lock().unwrap().insert(hash);
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self, code: MessageCode) -> usize {
        self.sent().iter().filter(|m| m.code == code).count()
    }

    pub fn commit_failures(&self) -> usize {
        *self.commit_failures.lock().unwrap()
    }

    fn take_head_moved(&self) -> bool {
        std::mem::take(&mut *self.head_moved.lock().unwrap())
    }

    fn set(&self) -> ValidatorSet {
        ValidatorSet::new(self.validators.clone(), self.policy).unwrap()
    }
}

impl Backend<Block> for TestBackend {
    fn address(&self) -> Address {
        self.key.address()
    }

    fn validators(&self, _proposal: &Block) -> ValidatorSet {
        self.set()
    }

    fn send(&self, payload: Vec<u8>, target: Address) -> Result<(), ConsensusError> {
        self.network.lock().unwrap().push_back(Envelope {
            from: self.address(),
            to: target,
            payload,
        });
        Ok(())
    }

    fn broadcast(&self, validators: &ValidatorSet, payload: Vec<u8>) -> Result<(), ConsensusError> {
        self.sent.lock().unwrap().push(Message::decode(&payload)?);
        self.gossip(validators, payload)
    }

    fn gossip(&self, validators: &ValidatorSet, payload: Vec<u8>) -> Result<(), ConsensusError> {
        for target in validators.addresses() {
            if target != self.address() {
                self.send(payload.clone(), target)?;
            }
        }
        Ok(())
    }

    fn commit(&self, proposal: &Block, seals: Vec<Signature>) -> Result<(), ConsensusError> {
        if let Err(e) = verify_committed_seals(&proposal.hash(), &seals, &self.set()) {
            *self.commit_failures.lock().unwrap() += 1;
            return Err(e);
        }

        let mut chain = self.chain.lock().unwrap();
        if let Some(existing) = chain.get(proposal.number() as usize) {
            if existing.hash() == proposal.hash() {
                return Ok(());
            }
            return Err(ConsensusError::InvalidProposal("conflicting block".to_string()));
        }
        chain.push(proposal.with_seals(seals));
        *self.head_moved.lock().unwrap() = true;
        Ok(())
    }

    fn verify(&self, proposal: &Block) -> Result<Duration, ConsensusError> {
        if self.rejected.lock().unwrap().contains(&proposal.hash()) {
            return Err(ConsensusError::InvalidProposal("rejected by test".to_string()));
        }
        let head = self.head();
        if proposal.number() != head.number() + 1 || proposal.header.parent_hash != head.hash() {
            return Err(ConsensusError::InvalidProposal("not a child of head".to_string()));
        }
        if !proposal.verify_payload_hash() {
            return Err(ConsensusError::InvalidProposal("payload hash".to_string()));
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
        check_validator_signature(&self.set(), data, signature)
    }

    fn last_proposal(&self) -> (Block, Address) {
        let head = self.head();
        let proposer = head.header.proposer;
        (head, proposer)
    }
}

/// A group of validators wired to one shared message queue
pub struct TestSystem {
    pub keys: Vec<KeyPair>,
    pub backends: Vec<Arc<TestBackend>>,
    pub cores: Vec<Core<Block, TestBackend>>,
    pub network: Network,
    pub genesis: Block,
    pub offline: HashSet<usize>,
    pub dropped_codes: HashSet<MessageCode>,
    /// Validator whose outgoing committed seals are corrupted in transit
    pub corrupt_seals_from: Option<usize>,
    /// Errors returned by delivered messages, by receiving validator
    pub errors: Vec<(usize, ConsensusError)>,
}

impl TestSystem {
    pub fn new(n: usize) -> Self {
        Self::with_config(n, Config::default())
    }

    pub fn with_config(n: usize, config: Config) -> Self {
        let mut keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
        keys.sort_by_key(|k| k.address());
        let addresses: Vec<Address> = keys.iter().map(|k| k.address()).collect();

        let genesis = GenesisConfig {
            chain_id: 1,
            timestamp: 0,
            extra: encode_validators(&addresses),
        }
        .create_genesis_block();
        let network: Network = Arc::new(Mutex::new(VecDeque::new()));

        let backends: Vec<Arc<TestBackend>> = keys
            .iter()
            .map(|key| {
                Arc::new(TestBackend::new(
                    key.clone(),
                    addresses.clone(),
                    config.proposer_policy,
                    genesis.clone(),
                    Arc::clone(&network),
                ))
            })
            .collect();

        let cores = backends
            .iter()
            .map(|backend| {
                let mut core = Core::new(config.clone(), Arc::clone(backend));
                core.take_effects();
                core
            })
            .collect();

        TestSystem {
            keys,
            backends,
            cores,
            network,
            genesis,
            offline: HashSet::new(),
            dropped_codes: HashSet::new(),
            corrupt_seals_from: None,
            errors: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.keys.len()
    }

    pub fn address(&self, index: usize) -> Address {
        self.keys[index].address()
    }

    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.keys.iter().position(|k| k.address() == *address)
    }

    pub fn online(&self) -> Vec<usize> {
        (0..self.size()).filter(|i| !self.offline.contains(i)).collect()
    }

    /// Build the next block on validator `index`'s head, proposed by it
    pub fn build_block(&self, index: usize, payload: &[u8]) -> Block {
        let head = self.backends[index].head();
        Block::child(
            &head,
            head.header.timestamp + 1,
            self.address(index),
            payload.to_vec(),
            Vec::new(),
        )
    }

    /// Every online validator offers its own block for the next sequence
    pub fn request_all(&mut self, payload: &[u8]) {
        for i in self.online() {
            let block = self.build_block(i, payload);
            let _ = self.cores[i].handle_request(block);
        }
    }

    pub fn fire_timeouts(&mut self) {
        for i in self.online() {
            self.cores[i].handle_timeout();
        }
    }

    pub fn fire_timeout(&mut self, index: usize) {
        self.cores[index].handle_timeout();
    }

    /// Process effects, head changes and queued messages until nothing moves
    pub fn run_until_idle(&mut self) {
        loop {
            let mut progressed = false;

            for i in 0..self.size() {
                for effect in self.cores[i].take_effects() {
                    if let Effect::Verify { message, proposal } = effect {
                        if self.offline.contains(&i) {
                            continue;
                        }
                        let result = self.backends[i].verify(&proposal).map(|_| ());
                        if let Err(e) = self.cores[i].handle_verified(message, proposal, result) {
                            self.errors.push((i, e));
                        }
                        progressed = true;
                    }
                }
            }

            for i in 0..self.size() {
                if self.backends[i].take_head_moved() {
                    if let Err(e) = self.cores[i].handle_final_committed() {
                        self.errors.push((i, e));
                    }
                    progressed = true;
                }
            }

            let next = self.network.lock().unwrap().pop_front();
            if let Some(envelope) = next {
                self.deliver(envelope);
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
    }

    fn deliver(&mut self, envelope: Envelope) {
        let Some(to) = self.index_of(&envelope.to) else {
            return;
        };
        if self.offline.contains(&to) {
            return;
        }

        let mut payload = envelope.payload;
        let message = Message::decode(&payload).unwrap();
        if self.dropped_codes.contains(&message.code) {
            return;
        }
        if let Some(byzantine) = self.corrupt_seals_from {
            if message.code == MessageCode::Commit && envelope.from == self.address(byzantine) {
                payload = self.corrupt_seal(byzantine, message);
            }
        }

        if let Err(e) = self.cores[to].handle_message(&payload) {
            self.errors.push((to, e));
        }
    }

    /// Flip a byte of the committed seal and re-sign the envelope so only the
    /// seal is invalid
    fn corrupt_seal(&self, from: usize, mut message: Message) -> Vec<u8> {
        if let Some(seal) = message.committed_seal.as_mut() {
            seal.bytes[0] ^= 0xff;
        }
        self.sign(from, message)
    }

    pub fn sign(&self, from: usize, mut message: Message) -> Vec<u8> {
        message.signature = None;
        let data = message.signing_bytes().unwrap();
        message.signature = Some(sign_message(&self.keys[from].secret, &data));
        message.encode().unwrap()
    }

    pub fn craft_subject(
        &self,
        from: usize,
        code: MessageCode,
        view: View,
        digest: Hash,
    ) -> Vec<u8> {
        let subject = Subject { view, digest };
        let mut message = Message::with_subject(code, &subject, self.address(from)).unwrap();
        if code == MessageCode::Commit {
            message.committed_seal = Some(self.seal(from, &digest));
        }
        self.sign(from, message)
    }

    /// Commit from `from` whose committed seal does not verify
    pub fn craft_corrupt_commit(&self, from: usize, view: View, digest: Hash) -> Vec<u8> {
        let payload = self.craft_subject(from, MessageCode::Commit, view, digest);
        self.corrupt_seal(from, Message::decode(&payload).unwrap())
    }

    pub fn craft_preprepare(&self, from: usize, view: View, proposal: &Block) -> Vec<u8> {
        let preprepare = Preprepare {
            view,
            proposal: proposal.clone(),
        };
        let message = Message::with_preprepare(&preprepare, self.address(from)).unwrap();
        self.sign(from, message)
    }

    pub fn seal(&self, from: usize, digest: &Hash) -> Signature {
        sign_message(
            &self.keys[from].secret,
            &bosphor_consensus::committed_seal_bytes(digest),
        )
    }

    pub fn deliver_to(&mut self, to: usize, payload: &[u8]) -> Result<(), ConsensusError> {
        self.cores[to].handle_message(payload)
    }

    /// Assert every listed validator holds the same chain up to its height
    pub fn assert_consistent(&self, nodes: &[usize]) {
        let max = nodes
            .iter()
            .map(|i| self.backends[*i].height())
            .max()
            .unwrap_or(0);
        for number in 1..=max {
            let hashes: HashSet<Hash> = nodes
                .iter()
                .filter_map(|i| self.backends[*i].block_at(number))
                .map(|b| b.hash())
                .collect();
            assert!(hashes.len() <= 1, "conflicting blocks at height {}", number);
        }
    }
}
