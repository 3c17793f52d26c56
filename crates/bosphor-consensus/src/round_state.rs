use std::collections::{BTreeMap, HashSet};

use bosphor_core::{Address, Hash};

use crate::backend::Proposal;
use crate::error::ConsensusError;
use crate::message::{Message, Preprepare, Subject, View};
use crate::message_set::MessageSet;
use crate::validator::ValidatorSet;

/// Votes and lock for the view currently being decided.
///
/// The lock and the round-change votes outlive a single round; everything
/// else is reset whenever the round moves.
#[derive(Debug, Clone)]
pub struct RoundState<P> {
    view: View,
    validators: ValidatorSet,
    preprepare: Option<Preprepare<P>>,
    prepares: MessageSet,
    commits: MessageSet,
    locked: Option<P>,
    round_changes: BTreeMap<u64, MessageSet>,
}

impl<P: Proposal> RoundState<P> {
    pub fn new(
        view: View,
        validators: ValidatorSet,
        locked: Option<P>,
        mut round_changes: BTreeMap<u64, MessageSet>,
    ) -> Self {
        round_changes.retain(|round, _| *round >= view.round);
        RoundState {
            view,
            prepares: MessageSet::new(validators.clone()),
            commits: MessageSet::new(validators.clone()),
            validators,
            preprepare: None,
            locked,
            round_changes,
        }
    }

    /// Move to `round` of the same sequence, keeping the lock and the
    /// round-change votes at or above `round`
    pub fn move_to_round(&mut self, round: u64) {
        self.view = View::new(self.view.sequence, round);
        self.preprepare = None;
        self.prepares = MessageSet::new(self.validators.clone());
        self.commits = MessageSet::new(self.validators.clone());
        self.clear_round_changes_below(round);
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn sequence(&self) -> u64 {
        self.view.sequence
    }

    pub fn round(&self) -> u64 {
        self.view.round
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn preprepare(&self) -> Option<&Preprepare<P>> {
        self.preprepare.as_ref()
    }

    pub fn set_preprepare(&mut self, preprepare: Preprepare<P>) {
        self.preprepare = Some(preprepare);
    }

    /// Proposal accepted in this round, if any
    pub fn proposal(&self) -> Option<&P> {
        self.preprepare.as_ref().map(|pp| &pp.proposal)
    }

    /// Subject other validators should vote on in this round
    pub fn subject(&self) -> Option<Subject> {
        self.proposal().map(|proposal| Subject {
            view: self.view,
            digest: proposal.hash(),
        })
    }

    pub fn prepares(&self) -> &MessageSet {
        &self.prepares
    }

    pub fn prepares_mut(&mut self) -> &mut MessageSet {
        &mut self.prepares
    }

    pub fn commits(&self) -> &MessageSet {
        &self.commits
    }

    pub fn commits_mut(&mut self) -> &mut MessageSet {
        &mut self.commits
    }

    /// Lock onto the accepted proposal
    pub fn lock_hash(&mut self) {
        if let Some(proposal) = self.proposal() {
            self.locked = Some(proposal.clone());
        }
    }

    pub fn unlock_hash(&mut self) {
        self.locked = None;
    }

    pub fn is_hash_locked(&self) -> bool {
        self.locked.is_some()
    }

    pub fn locked_hash(&self) -> Option<Hash> {
        self.locked.as_ref().map(Proposal::hash)
    }

    pub fn locked_proposal(&self) -> Option<&P> {
        self.locked.as_ref()
    }

    /// Distinct validators that voted Prepare or Commit for this round.
    /// A Commit implies the sender also prepared.
    pub fn prepare_or_commit_size(&self) -> usize {
        let senders: HashSet<Address> = self
            .prepares
            .values()
            .chain(self.commits.values())
            .map(|m| m.address)
            .collect();
        senders.len()
    }

    /// Record a RoundChange vote for `round` and return the vote count
    pub fn add_round_change(
        &mut self,
        round: u64,
        message: Message,
    ) -> Result<usize, ConsensusError> {
        let set = self
            .round_changes
            .entry(round)
            .or_insert_with(|| MessageSet::new(self.validators.clone()));
        set.add(message)?;
        Ok(set.size())
    }

    pub fn round_change_count(&self, round: u64) -> usize {
        self.round_changes.get(&round).map(MessageSet::size).unwrap_or(0)
    }

    pub fn clear_round_changes_below(&mut self, round: u64) {
        self.round_changes.retain(|r, _| *r >= round);
    }

    /// Highest round with at least `threshold` RoundChange votes
    pub fn max_round_with(&self, threshold: usize) -> Option<u64> {
        self.round_changes
            .iter()
            .rev()
            .find(|(_, set)| set.size() >= threshold)
            .map(|(round, _)| *round)
    }
}
