use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use bosphor_core::{Address, Hash, Signature};
use tracing::{debug, info, warn};

use crate::backend::{Backend, Proposal};
use crate::config::Config;
use crate::error::ConsensusError;
use crate::events::Effect;
use crate::message::{committed_seal_bytes, Message, MessageCode, Preprepare, Subject, View};
use crate::round_state::RoundState;
use crate::validator::ValidatorSet;

/// Phase of the current round
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    AcceptRequest,
    Preprepared,
    Prepared,
    Committed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::AcceptRequest => "accept-request",
            State::Preprepared => "preprepared",
            State::Prepared => "prepared",
            State::Committed => "committed",
        };
        f.write_str(name)
    }
}

/// Istanbul BFT state machine for a single validator.
///
/// `Core` is synchronous: every handler runs to completion and leaves any
/// timer or verification work in the effect queue for the caller to carry
/// out. Messages this node broadcasts are also fed back into its own
/// handlers before the call returns.
pub struct Core<P: Proposal, B: Backend<P>> {
    config: Config,
    backend: Arc<B>,
    address: Address,
    state: State,
    validators: ValidatorSet,
    current: RoundState<P>,
    last_proposer: Address,
    waiting_for_round_change: bool,
    pending_request: Option<P>,
    /// View and proposal whose verification is in flight
    verifying: Option<(View, Hash)>,
    /// RoundChange messages for later sequences, newest per validator
    backlog: HashMap<Address, Message>,
    /// Messages for the round we are waiting to start
    parked: HashMap<(Address, MessageCode), Message>,
    effects: Vec<Effect<P>>,
    /// Own messages waiting to be handled locally
    pending: VecDeque<Message>,
}

impl<P: Proposal, B: Backend<P>> Core<P, B> {
    /// Start at the sequence after the backend's last proposal
    pub fn new(config: Config, backend: Arc<B>) -> Self {
        let address = backend.address();
        let (last, last_proposer) = backend.last_proposal();
        let mut validators = backend.validators(&last).with_policy(config.proposer_policy);
        validators.calc_proposer(&last_proposer, 0);

        let view = View::new(last.number() + 1, 0);
        let current = RoundState::new(view, validators.clone(), None, BTreeMap::new());
        let mut core = Core {
            config,
            backend,
            address,
            state: State::AcceptRequest,
            validators,
            current,
            last_proposer,
            waiting_for_round_change: false,
            pending_request: None,
            verifying: None,
            backlog: HashMap::new(),
            parked: HashMap::new(),
            effects: Vec::new(),
            pending: VecDeque::new(),
        };
        core.reset_timer();
        core
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn view(&self) -> View {
        self.current.view()
    }

    pub fn round_state(&self) -> &RoundState<P> {
        &self.current
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn proposer(&self) -> Option<Address> {
        self.validators.proposer().map(|v| v.address())
    }

    pub fn is_proposer(&self) -> bool {
        self.validators.is_proposer(&self.address)
    }

    pub fn locked_hash(&self) -> Option<Hash> {
        self.current.locked_hash()
    }

    pub fn is_waiting_for_round_change(&self) -> bool {
        self.waiting_for_round_change
    }

    pub fn backlog_size(&self) -> usize {
        self.backlog.len()
    }

    /// Drain the effects produced since the last call
    pub fn take_effects(&mut self) -> Vec<Effect<P>> {
        std::mem::take(&mut self.effects)
    }

    /// Offer a locally built proposal for the current sequence
    pub fn handle_request(&mut self, proposal: P) -> Result<(), ConsensusError> {
        let sequence = self.current.sequence();
        if proposal.number() < sequence {
            return Err(ConsensusError::OldMessage);
        }
        if proposal.number() > sequence {
            return Err(ConsensusError::FutureMessage);
        }

        debug!(
            "Request for sequence {} with proposal {}",
            sequence,
            proposal.hash().short()
        );
        self.pending_request = Some(proposal);
        if self.state == State::AcceptRequest && !self.waiting_for_round_change {
            self.send_preprepare();
        }
        self.drain_pending();
        Ok(())
    }

    /// Handle an encoded message received from a peer
    pub fn handle_message(&mut self, payload: &[u8]) -> Result<(), ConsensusError> {
        let message = Message::decode(payload)?;
        self.check_sender(&message)?;
        let result = self.process(message);
        self.drain_pending();
        result
    }

    /// Resume a Preprepare once its proposal has been checked by the backend
    pub fn handle_verified(
        &mut self,
        message: Message,
        proposal: P,
        result: Result<(), ConsensusError>,
    ) -> Result<(), ConsensusError> {
        let hash = proposal.hash();
        if self.verifying == Some((message.view, hash)) {
            self.verifying = None;
        }

        if message.view != self.current.view()
            || self.state != State::AcceptRequest
            || self.waiting_for_round_change
        {
            debug!(
                "Dropping verification of {} for stale view {}",
                hash.short(),
                message.view
            );
            return Err(ConsensusError::OldMessage);
        }

        if let Err(e) = result {
            warn!("Proposal {} failed verification: {}", hash.short(), e);
            return Err(match e {
                ConsensusError::InvalidProposal(reason) => ConsensusError::InvalidProposal(reason),
                other => ConsensusError::InvalidProposal(other.to_string()),
            });
        }

        let locked = self.current.locked_hash();
        if let Some(locked) = locked {
            if locked != hash {
                return Err(ConsensusError::LockedProposal(locked));
            }
        }

        self.accept_preprepare(Preprepare {
            view: message.view,
            proposal,
        });
        if locked.is_some() {
            // Locked on this proposal already: the earlier prepare quorum stands
            self.set_state(State::Prepared);
            self.send_commit();
        } else {
            self.set_state(State::Preprepared);
            self.send_subject(MessageCode::Prepare);
        }
        self.check_quorums();
        self.drain_pending();
        Ok(())
    }

    /// Round-change timer fired
    pub fn handle_timeout(&mut self) {
        let round = self.current.round();
        if !self.waiting_for_round_change {
            let threshold = self.validators.round_change_threshold();
            if let Some(max) = self.current.max_round_with(threshold) {
                if max > round {
                    self.send_round_change(max);
                    self.drain_pending();
                    return;
                }
            }
        }

        let (last, last_proposer) = self.backend.last_proposal();
        if last.number() >= self.current.sequence() {
            self.start_sequence(&last, last_proposer);
        } else {
            info!(
                "Round {} of sequence {} timed out in state {}",
                round,
                self.current.sequence(),
                self.state
            );
            self.send_round_change(round + 1);
        }
        self.drain_pending();
    }

    /// The backend advanced its head; move to the following sequence
    pub fn handle_final_committed(&mut self) -> Result<(), ConsensusError> {
        let (last, last_proposer) = self.backend.last_proposal();
        if last.number() < self.current.sequence() {
            debug!(
                "Head {} is behind sequence {}, ignoring",
                last.number(),
                self.current.sequence()
            );
            return Ok(());
        }
        self.start_sequence(&last, last_proposer);
        self.drain_pending();
        Ok(())
    }

    fn check_sender(&self, message: &Message) -> Result<(), ConsensusError> {
        let signature = message
            .signature
            .as_ref()
            .ok_or(ConsensusError::InvalidSignature)?;
        let signer = self
            .backend
            .check_validator_signature(&message.signing_bytes()?, signature)?;
        if signer != message.address {
            return Err(ConsensusError::InvalidSignature);
        }
        if !self.validators.contains(&signer) {
            return Err(ConsensusError::UnauthorizedAddress(signer));
        }
        Ok(())
    }

    fn process(&mut self, message: Message) -> Result<(), ConsensusError> {
        if message.code == MessageCode::RoundChange {
            return self.handle_round_change(message);
        }

        if let Err(e) = self.check_view(message.view) {
            if self.waiting_for_round_change && message.view == self.current.view() {
                debug!(
                    "Parking {:?} from {} until round {} starts",
                    message.code,
                    message.address,
                    message.view.round
                );
                self.parked.insert((message.address, message.code), message);
            }
            return Err(e);
        }

        match message.code {
            MessageCode::Preprepare => self.handle_preprepare(message),
            MessageCode::Prepare => self.handle_prepare(message),
            MessageCode::Commit => self.handle_commit(message),
            MessageCode::RoundChange => self.handle_round_change(message),
        }
    }

    fn check_view(&self, view: View) -> Result<(), ConsensusError> {
        let current = self.current.view();
        if view < current {
            return Err(ConsensusError::OldMessage);
        }
        if view > current || self.waiting_for_round_change {
            return Err(ConsensusError::FutureMessage);
        }
        Ok(())
    }

    fn handle_preprepare(&mut self, message: Message) -> Result<(), ConsensusError> {
        if !self.validators.is_proposer(&message.address) {
            return Err(ConsensusError::NotFromProposer);
        }

        let preprepare: Preprepare<P> = message.preprepare()?;
        let proposal = preprepare.proposal;
        if proposal.number() != self.current.sequence() {
            return Err(ConsensusError::InvalidProposal(format!(
                "proposal number {} does not match sequence {}",
                proposal.number(),
                self.current.sequence()
            )));
        }
        if self.state != State::AcceptRequest {
            debug!("Already accepted a proposal in view {}", self.current.view());
            return Ok(());
        }

        let hash = proposal.hash();
        if let Some(locked) = self.current.locked_hash() {
            if locked != hash {
                return Err(ConsensusError::LockedProposal(locked));
            }
        }
        if let Some((view, pending)) = self.verifying {
            if view == message.view {
                debug!(
                    "Proposal {} already under verification in view {}, dropping {}",
                    pending.short(),
                    view,
                    hash.short()
                );
                return Ok(());
            }
        }

        debug!(
            "Verifying proposal {} from {} in view {}",
            hash.short(),
            message.address,
            message.view
        );
        self.verifying = Some((message.view, hash));
        self.effects.push(Effect::Verify { message, proposal });
        Ok(())
    }

    fn accept_preprepare(&mut self, preprepare: Preprepare<P>) {
        let digest = preprepare.proposal.hash();
        let matches = |m: &Message| m.subject().map(|s| s.digest == digest).unwrap_or(false);
        self.current.prepares_mut().retain(matches);
        self.current.commits_mut().retain(matches);
        self.current.set_preprepare(preprepare);
    }

    /// Decode a Prepare or Commit subject and compare it with the accepted
    /// proposal, if there is one yet
    fn check_subject(&self, message: &Message) -> Result<Subject, ConsensusError> {
        let subject = message.subject()?;
        if let Some(expected) = self.current.subject() {
            if subject != expected {
                return Err(ConsensusError::InconsistentSubject);
            }
        }
        Ok(subject)
    }

    fn handle_prepare(&mut self, message: Message) -> Result<(), ConsensusError> {
        self.check_subject(&message)?;
        debug!("Prepare from {} in view {}", message.address, message.view);
        self.current.prepares_mut().add(message)?;
        self.check_quorums();
        Ok(())
    }

    fn handle_commit(&mut self, message: Message) -> Result<(), ConsensusError> {
        self.check_subject(&message)?;
        if message.committed_seal.is_none() {
            return Err(ConsensusError::InvalidMessage(
                "commit without committed seal".to_string(),
            ));
        }
        debug!("Commit from {} in view {}", message.address, message.view);
        self.current.commits_mut().add(message)?;
        self.check_quorums();
        Ok(())
    }

    fn check_quorums(&mut self) {
        let quorum = self.validators.quorum_size();

        if self.state == State::Preprepared && self.current.prepare_or_commit_size() >= quorum {
            self.current.lock_hash();
            self.set_state(State::Prepared);
            self.send_commit();
        }

        if self.state < State::Committed
            && self.current.proposal().is_some()
            && self.current.commits().has_quorum()
        {
            self.commit();
        }
    }

    fn commit(&mut self) {
        let Some(proposal) = self.current.proposal().cloned() else {
            return;
        };
        let hash = proposal.hash();
        self.current.lock_hash();

        loop {
            let seals: Vec<Signature> = self
                .current
                .commits()
                .values()
                .filter_map(|m| m.committed_seal)
                .collect();

            match self.backend.commit(&proposal, seals) {
                Ok(()) => {
                    info!(
                        "Committed proposal {} at sequence {} round {}",
                        hash.short(),
                        self.current.sequence(),
                        self.current.round()
                    );
                    self.current.unlock_hash();
                    self.set_state(State::Committed);
                    return;
                }
                Err(ConsensusError::InvalidCommittedSeals) => {
                    let evicted = self.evict_invalid_seals(&hash);
                    warn!(
                        "Committed seals for {} rejected, dropped {} invalid commits",
                        hash.short(),
                        evicted
                    );
                    // Every eviction shrinks the set, so this ends
                    if evicted == 0 || !self.current.commits().has_quorum() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Failed to commit proposal {}: {}", hash.short(), e);
                    return;
                }
            }
        }
    }

    /// Drop the Commit messages whose seal was not made by their sender over
    /// `digest`; returns how many were dropped
    fn evict_invalid_seals(&mut self, digest: &Hash) -> usize {
        let data = committed_seal_bytes(digest);
        let backend = &self.backend;
        let commits = self.current.commits_mut();
        let before = commits.size();
        commits.retain(|m| {
            let valid = m
                .committed_seal
                .as_ref()
                .map(|seal| backend.check_signature(&data, &m.address, seal).is_ok())
                .unwrap_or(false);
            if !valid {
                debug!("Invalid committed seal from {}", m.address);
            }
            valid
        });
        before - commits.size()
    }

    fn handle_round_change(&mut self, message: Message) -> Result<(), ConsensusError> {
        let subject = message.subject()?;
        let view = subject.view;
        let current = self.current.view();

        if view.sequence < current.sequence
            || (view.sequence == current.sequence && view.round < current.round)
        {
            return Err(ConsensusError::OldMessage);
        }
        if view.sequence > current.sequence {
            self.store_backlog(message);
            return Err(ConsensusError::FutureMessage);
        }

        let count = self.current.add_round_change(view.round, message)?;
        debug!(
            "Round change to {} has {} votes in sequence {}",
            view.round, count, view.sequence
        );

        if count >= self.validators.quorum_size()
            && (self.waiting_for_round_change || view.round > current.round)
        {
            self.start_new_round(view.round);
        } else if self.waiting_for_round_change
            && count >= self.validators.round_change_threshold()
            && view.round > current.round
        {
            self.send_round_change(view.round);
        }
        Ok(())
    }

    fn store_backlog(&mut self, message: Message) {
        let newer = self
            .backlog
            .get(&message.address)
            .map(|stored| message.view > stored.view)
            .unwrap_or(true);
        if newer {
            debug!("Backlogged round change from {} for {}", message.address, message.view);
            self.backlog.insert(message.address, message);
        }
    }

    fn replay_backlog(&mut self) {
        let sequence = self.current.sequence();
        let (ready, later): (Vec<Message>, Vec<Message>) = std::mem::take(&mut self.backlog)
            .into_values()
            .filter(|m| m.view.sequence >= sequence)
            .partition(|m| m.view.sequence == sequence);

        for message in later {
            self.backlog.insert(message.address, message);
        }
        for message in ready {
            if !self.validators.contains(&message.address) {
                continue;
            }
            if let Err(e) = self.process(message) {
                log_error(&e);
            }
        }
    }

    /// Handle the messages parked for the round that just started,
    /// proposal first
    fn replay_parked(&mut self) {
        let view = self.current.view();
        let mut parked: Vec<Message> = std::mem::take(&mut self.parked)
            .into_values()
            .filter(|m| m.view == view)
            .collect();
        parked.sort_by_key(|m| m.code as u8);

        for message in parked {
            if let Err(e) = self.process(message) {
                log_error(&e);
            }
        }
    }

    fn start_sequence(&mut self, last: &P, last_proposer: Address) {
        let mut validators = self
            .backend
            .validators(last)
            .with_policy(self.config.proposer_policy);
        validators.calc_proposer(&last_proposer, 0);

        let view = View::new(last.number() + 1, 0);
        self.validators = validators;
        self.last_proposer = last_proposer;
        self.current = RoundState::new(view, self.validators.clone(), None, BTreeMap::new());
        self.waiting_for_round_change = false;
        self.verifying = None;
        self.parked.clear();
        self.set_state(State::AcceptRequest);
        if self
            .pending_request
            .as_ref()
            .map(|p| p.number() != view.sequence)
            .unwrap_or(false)
        {
            self.pending_request = None;
        }

        info!(
            "Starting sequence {} with {} validators, proposer {}",
            view.sequence,
            self.validators.size(),
            self.proposer().map(|p| p.to_string()).unwrap_or_default()
        );
        self.reset_timer();
        self.replay_backlog();
        self.send_preprepare();
    }

    fn start_new_round(&mut self, round: u64) {
        self.current.move_to_round(round);
        self.validators.calc_proposer(&self.last_proposer, round);
        self.waiting_for_round_change = false;
        self.verifying = None;
        self.set_state(State::AcceptRequest);

        info!(
            "Starting round {} of sequence {}, proposer {}",
            round,
            self.current.sequence(),
            self.proposer().map(|p| p.to_string()).unwrap_or_default()
        );
        self.reset_timer();
        self.send_preprepare();
        self.replay_parked();
    }

    /// Jump to `round` and wait there for a round-change quorum
    fn catch_up_round(&mut self, round: u64) {
        debug!(
            "Catching up from round {} to {} in sequence {}",
            self.current.round(),
            round,
            self.current.sequence()
        );
        self.current.move_to_round(round);
        self.waiting_for_round_change = true;
        self.verifying = None;
        self.parked.clear();
        self.set_state(State::AcceptRequest);
        self.reset_timer();
    }

    fn send_round_change(&mut self, round: u64) {
        if round <= self.current.round() && !self.waiting_for_round_change {
            warn!(
                "Refusing round change to {} from round {}",
                round,
                self.current.round()
            );
            return;
        }
        self.catch_up_round(round);
        let subject = Subject {
            view: self.current.view(),
            digest: Hash::ZERO,
        };
        self.broadcast(MessageCode::RoundChange, &subject, None);
    }

    /// Propose the locked proposal, or else the pending request, when this
    /// node is the proposer of the current round
    fn send_preprepare(&mut self) {
        if !self.is_proposer()
            || self.state != State::AcceptRequest
            || self.waiting_for_round_change
            || self.verifying.is_some()
        {
            return;
        }
        let sequence = self.current.sequence();
        let proposal = match self.current.locked_proposal() {
            Some(locked) => locked.clone(),
            None => match &self.pending_request {
                Some(request) if request.number() == sequence => request.clone(),
                _ => return,
            },
        };

        info!(
            "Proposing {} for view {}",
            proposal.hash().short(),
            self.current.view()
        );
        let preprepare = Preprepare {
            view: self.current.view(),
            proposal,
        };
        match Message::with_preprepare(&preprepare, self.address) {
            Ok(message) => self.sign_and_broadcast(message),
            Err(e) => warn!("Failed to encode preprepare: {}", e),
        }
    }

    fn send_subject(&mut self, code: MessageCode) {
        if let Some(subject) = self.current.subject() {
            self.broadcast(code, &subject, None);
        }
    }

    fn send_commit(&mut self) {
        let Some(subject) = self.current.subject() else {
            return;
        };
        match self.backend.sign(&committed_seal_bytes(&subject.digest)) {
            Ok(seal) => self.broadcast(MessageCode::Commit, &subject, Some(seal)),
            Err(e) => warn!("Failed to sign committed seal: {}", e),
        }
    }

    fn broadcast(&mut self, code: MessageCode, subject: &Subject, seal: Option<Signature>) {
        match Message::with_subject(code, subject, self.address) {
            Ok(mut message) => {
                message.committed_seal = seal;
                self.sign_and_broadcast(message);
            }
            Err(e) => warn!("Failed to encode {:?}: {}", code, e),
        }
    }

    /// Sign `message`, hand it to the backend and queue it for local handling
    fn sign_and_broadcast(&mut self, mut message: Message) {
        if !self.validators.contains(&self.address) {
            debug!("Not a validator, skipping {:?}", message.code);
            return;
        }

        let signed = message
            .signing_bytes()
            .and_then(|data| self.backend.sign(&data));
        let payload = match signed {
            Ok(signature) => {
                message.signature = Some(signature);
                message.encode()
            }
            Err(e) => Err(e),
        };
        match payload {
            Ok(payload) => {
                if let Err(e) = self.backend.broadcast(&self.validators, payload) {
                    warn!("Failed to broadcast {:?}: {}", message.code, e);
                }
                self.pending.push_back(message);
            }
            Err(e) => warn!("Failed to sign {:?}: {}", message.code, e),
        }
    }

    fn drain_pending(&mut self) {
        while let Some(message) = self.pending.pop_front() {
            if let Err(e) = self.process(message) {
                log_error(&e);
            }
        }
    }

    fn reset_timer(&mut self) {
        let timeout = self.config.round_change_timeout(self.current.round());
        self.effects.push(Effect::ResetTimer(timeout));
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!("State {} -> {} in view {}", self.state, state, self.current.view());
            self.state = state;
        }
    }
}

/// Log a per-message error at a level matching its severity
pub(crate) fn log_error(error: &ConsensusError) {
    if error.is_informational() {
        debug!("Dropped message: {}", error);
    } else {
        warn!("Rejected message: {}", error);
    }
}
