use std::collections::HashSet;
use std::fmt;

use bosphor_core::{recover_signer, Address, Signature, ADDRESS_LENGTH};
use serde::{Deserialize, Serialize};

use crate::config::ProposerPolicy;
use crate::error::ConsensusError;

/// A validator identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Validator {
    address: Address,
}

impl Validator {
    pub fn new(address: Address) -> Self {
        Validator { address }
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Ordered roster of validators with a proposer selection policy.
///
/// Validators are kept sorted by address so every node derives the same
/// indices, and therefore the same proposer, from the same membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    policy: ProposerPolicy,
    proposer: Option<Validator>,
}

impl ValidatorSet {
    /// Create a validator set, rejecting duplicate addresses
    pub fn new(
        addresses: impl IntoIterator<Item = Address>,
        policy: ProposerPolicy,
    ) -> Result<Self, ConsensusError> {
        let mut seen = HashSet::new();
        let mut validators = Vec::new();
        for address in addresses {
            if !seen.insert(address) {
                return Err(ConsensusError::DuplicateValidator(address));
            }
            validators.push(Validator::new(address));
        }
        validators.sort();

        Ok(ValidatorSet {
            validators,
            policy,
            proposer: None,
        })
    }

    pub fn policy(&self) -> ProposerPolicy {
        self.policy
    }

    /// Same membership under a different policy; the calculated proposer is cleared
    pub fn with_policy(mut self, policy: ProposerPolicy) -> Self {
        if self.policy != policy {
            self.policy = policy;
            self.proposer = None;
        }
        self
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn list(&self) -> &[Validator] {
        &self.validators
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.validators.iter().map(Validator::address).collect()
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    /// Look up a validator and its index
    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
            .map(|index| (index, &self.validators[index]))
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Maximum number of faulty validators tolerated: floor((N - 1) / 3)
    pub fn f(&self) -> usize {
        self.validators.len().saturating_sub(1) / 3
    }

    /// Votes required to prepare or commit: 2F + 1
    pub fn quorum_size(&self) -> usize {
        2 * self.f() + 1
    }

    /// Round-change votes that prove at least one honest validator moved on: F + 1
    pub fn round_change_threshold(&self) -> usize {
        self.f() + 1
    }

    /// Select the proposer for `round` given the proposer of the last block.
    ///
    /// With no known last proposer the round alone picks the index. Otherwise
    /// round-robin moves one past the last proposer and sticky stays on it,
    /// both shifted by the round.
    pub fn proposer_at(&self, last_proposer: &Address, round: u64) -> Option<&Validator> {
        let n = self.validators.len() as u64;
        if n == 0 {
            return None;
        }

        let round_offset = round % n;
        let pick = match self.get_by_address(last_proposer) {
            None => round_offset,
            Some((index, _)) => {
                let base = index as u64 + round_offset;
                match self.policy {
                    ProposerPolicy::RoundRobin => base + 1,
                    ProposerPolicy::Sticky => base,
                }
            }
        } % n;

        self.validators.get(pick as usize)
    }

    /// Calculate and remember the proposer for `round`
    pub fn calc_proposer(&mut self, last_proposer: &Address, round: u64) {
        self.proposer = self.proposer_at(last_proposer, round).copied();
    }

    pub fn proposer(&self) -> Option<&Validator> {
        self.proposer.as_ref()
    }

    pub fn is_proposer(&self, address: &Address) -> bool {
        self.proposer.map(|p| p.address == *address).unwrap_or(false)
    }

    /// Add a validator; returns false if it is already a member
    pub fn add_validator(&mut self, address: Address) -> bool {
        match self.validators.binary_search_by(|v| v.address.cmp(&address)) {
            Ok(_) => false,
            Err(position) => {
                self.validators.insert(position, Validator::new(address));
                true
            }
        }
    }

    /// Remove a validator; returns false if it was not a member
    pub fn remove_validator(&mut self, address: &Address) -> bool {
        match self.validators.binary_search_by(|v| v.address.cmp(address)) {
            Ok(position) => {
                self.validators.remove(position);
                if self.is_proposer(address) {
                    self.proposer = None;
                }
                true
            }
            Err(_) => false,
        }
    }
}

/// Unpack validator addresses from a header extra field
pub fn extract_validators(extra: &[u8]) -> Result<Vec<Address>, ConsensusError> {
    if extra.len() % ADDRESS_LENGTH != 0 {
        return Err(ConsensusError::InvalidExtraData(extra.len()));
    }

    extra
        .chunks_exact(ADDRESS_LENGTH)
        .map(|chunk| Address::from_slice(chunk).map_err(ConsensusError::from))
        .collect()
}

/// Pack validator addresses into a header extra field
pub fn encode_validators(addresses: &[Address]) -> Vec<u8> {
    let mut extra = Vec::with_capacity(addresses.len() * ADDRESS_LENGTH);
    for address in addresses {
        extra.extend_from_slice(address.as_bytes());
    }
    extra
}

/// Whether block `number` is a validator set checkpoint
pub fn is_checkpoint(number: u64, epoch: u64) -> bool {
    epoch != 0 && number % epoch == 0
}

/// Verify `signature` over `data` and require the signer to be in `validators`
pub fn check_validator_signature(
    validators: &ValidatorSet,
    data: &[u8],
    signature: &Signature,
) -> Result<Address, ConsensusError> {
    let signer = recover_signer(data, signature).map_err(|_| ConsensusError::InvalidSignature)?;
    if !validators.contains(&signer) {
        return Err(ConsensusError::UnauthorizedAddress(signer));
    }
    Ok(signer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosphor_core::{sign_message, KeyPair};

    fn addresses(n: usize) -> Vec<Address> {
        (0..n).map(|_| KeyPair::generate().address()).collect()
    }

    fn sorted_set(n: usize, policy: ProposerPolicy) -> ValidatorSet {
        ValidatorSet::new(addresses(n), policy).unwrap()
    }

    #[test]
    fn test_validator_set_sorted_and_indexed() {
        let set = sorted_set(5, ProposerPolicy::RoundRobin);
        assert_eq!(set.size(), 5);
        for (i, validator) in set.list().iter().enumerate() {
            let (index, found) = set.get_by_address(&validator.address()).unwrap();
            assert_eq!(index, i);
            assert_eq!(found, validator);
            if i > 0 {
                assert!(set.list()[i - 1] < *validator);
            }
        }
        assert!(set.get_by_address(&KeyPair::generate().address()).is_none());
    }

    #[test]
    fn test_duplicate_validator_rejected() {
        let mut addrs = addresses(3);
        addrs.push(addrs[1]);
        assert!(matches!(
            ValidatorSet::new(addrs, ProposerPolicy::RoundRobin),
            Err(ConsensusError::DuplicateValidator(_))
        ));
    }

    #[test]
    fn test_quorum_arithmetic() {
        let cases = [(1, 0, 1), (3, 0, 1), (4, 1, 3), (6, 1, 3), (7, 2, 5), (10, 3, 7)];
        for (n, f, quorum) in cases {
            let set = sorted_set(n, ProposerPolicy::RoundRobin);
            assert_eq!(set.f(), f, "F for N={}", n);
            assert_eq!(set.quorum_size(), quorum, "quorum for N={}", n);
            assert_eq!(set.round_change_threshold(), f + 1);
        }
    }

    #[test]
    fn test_round_robin_without_last_proposer() {
        let set = sorted_set(4, ProposerPolicy::RoundRobin);
        for round in 0..8u64 {
            let proposer = set.proposer_at(&Address::ZERO, round).unwrap();
            assert_eq!(*proposer, set.list()[(round % 4) as usize]);
        }
    }

    #[test]
    fn test_round_robin_is_deterministic_and_shifts_by_round() {
        let set = sorted_set(4, ProposerPolicy::RoundRobin);
        let last = set.list()[2].address();

        assert_eq!(set.proposer_at(&last, 0), set.proposer_at(&last, 0));
        assert_eq!(*set.proposer_at(&last, 0).unwrap(), set.list()[3]);

        for round in 0..10u64 {
            let (a, _) = set
                .get_by_address(&set.proposer_at(&last, round).unwrap().address())
                .unwrap();
            let (b, _) = set
                .get_by_address(&set.proposer_at(&last, round + 1).unwrap().address())
                .unwrap();
            assert_eq!((a + 1) % 4, b);
        }
    }

    #[test]
    fn test_sticky_keeps_last_proposer() {
        let set = sorted_set(4, ProposerPolicy::Sticky);
        let last = set.list()[1].address();

        assert_eq!(set.proposer_at(&last, 0).unwrap().address(), last);
        assert_eq!(*set.proposer_at(&last, 1).unwrap(), set.list()[2]);
        assert_eq!(*set.proposer_at(&last, 4).unwrap(), set.list()[1]);
    }

    #[test]
    fn test_calc_and_is_proposer() {
        let mut set = sorted_set(4, ProposerPolicy::RoundRobin);
        assert!(set.proposer().is_none());

        set.calc_proposer(&Address::ZERO, 1);
        let expected = set.list()[1].address();
        assert!(set.is_proposer(&expected));
        assert!(!set.is_proposer(&set.list()[0].address()));
    }

    #[test]
    fn test_empty_set_has_no_proposer() {
        let mut set = ValidatorSet::new(Vec::new(), ProposerPolicy::RoundRobin).unwrap();
        set.calc_proposer(&Address::ZERO, 0);
        assert!(set.proposer().is_none());
        assert!(!set.is_proposer(&Address::ZERO));
    }

    #[test]
    fn test_add_and_remove_validator() {
        let mut set = sorted_set(3, ProposerPolicy::RoundRobin);
        let newcomer = KeyPair::generate().address();

        assert!(set.add_validator(newcomer));
        assert!(!set.add_validator(newcomer));
        assert_eq!(set.size(), 4);
        assert!(set.contains(&newcomer));
        assert!(set.list().windows(2).all(|w| w[0] < w[1]));

        assert!(set.remove_validator(&newcomer));
        assert!(!set.remove_validator(&newcomer));
        assert_eq!(set.size(), 3);
    }

    #[test]
    fn test_extra_encoding() {
        let addrs = addresses(3);
        let extra = encode_validators(&addrs);
        assert_eq!(extra.len(), 3 * ADDRESS_LENGTH);
        assert_eq!(extract_validators(&extra).unwrap(), addrs);
        assert!(extract_validators(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_extra_rejected() {
        let mut extra = encode_validators(&addresses(2));
        extra.push(0xff);
        assert!(matches!(
            extract_validators(&extra),
            Err(ConsensusError::InvalidExtraData(41))
        ));
    }

    #[test]
    fn test_checkpoints() {
        assert!(is_checkpoint(0, 30));
        assert!(is_checkpoint(60, 30));
        assert!(!is_checkpoint(61, 30));
        assert!(!is_checkpoint(5, 0));
    }

    #[test]
    fn test_check_validator_signature() {
        let keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
        let set = ValidatorSet::new(keys.iter().map(|k| k.address()), ProposerPolicy::RoundRobin)
            .unwrap();
        let data = b"dummy data";

        for key in &keys {
            let sig = sign_message(&key.secret, data);
            assert_eq!(check_validator_signature(&set, data, &sig).unwrap(), key.address());
        }

        let outsider = KeyPair::generate();
        let sig = sign_message(&outsider.secret, data);
        assert!(matches!(
            check_validator_signature(&set, data, &sig),
            Err(ConsensusError::UnauthorizedAddress(_))
        ));

        let sig = sign_message(&keys[0].secret, data);
        assert!(matches!(
            check_validator_signature(&set, b"other data", &sig),
            Err(ConsensusError::InvalidSignature)
        ));
    }
}
