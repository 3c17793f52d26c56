use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Result};
use bosphor_consensus::{encode_validators, Config};
use bosphor_core::{Address, GenesisConfig, KeyPair};
use serde::{Deserialize, Serialize};

use crate::chain::ValidatorChange;

/// Devnet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Chain ID
    pub chain_id: u64,

    /// Genesis block timestamp in seconds
    pub genesis_timestamp: u64,

    /// Validators run by this devnet
    pub validators: Vec<ValidatorEntry>,

    /// Consensus parameters shared by every validator
    #[serde(default)]
    pub consensus: Config,

    /// Interval between synthetic transactions in milliseconds, 0 disables them
    #[serde(default = "default_tx_interval_ms")]
    pub tx_interval_ms: u64,

    /// Block builder max transactions
    #[serde(default = "default_max_block_txs")]
    pub max_block_txs: usize,

    /// Transaction pool max size
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: usize,

    /// Validators (hex addresses) to add at the first checkpoint
    #[serde(default)]
    pub add_validators: Vec<String>,

    /// Validators (hex addresses) to remove at the first checkpoint
    #[serde(default)]
    pub remove_validators: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorEntry {
    /// Validator address (hex), must match the key
    pub address: String,
    /// Validator private key (hex)
    pub secret_key: String,
}

fn default_tx_interval_ms() -> u64 {
    250
}

fn default_max_block_txs() -> usize {
    100
}

fn default_pool_max_size() -> usize {
    10_000
}

impl ValidatorEntry {
    pub fn from_keypair(keypair: &KeyPair) -> Self {
        ValidatorEntry {
            address: keypair.address().to_hex(),
            secret_key: keypair.secret.to_hex(),
        }
    }

    pub fn keypair(&self) -> Result<KeyPair> {
        let keypair = KeyPair::from_secret_hex(&self.secret_key)?;
        let address = Address::from_hex(&self.address)?;
        if keypair.address() != address {
            bail!("Validator key does not match address {}", self.address);
        }
        Ok(keypair)
    }
}

impl NodeConfig {
    /// Load config from file
    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check everything the devnet needs before starting
    pub fn validate(&self) -> Result<()> {
        self.consensus.validate()?;
        if self.validators.is_empty() {
            bail!("At least one validator is required");
        }
        if self.max_block_txs == 0 || self.pool_max_size == 0 {
            bail!("max_block_txs and pool_max_size must be positive");
        }

        let mut seen = HashSet::new();
        for entry in &self.validators {
            let keypair = entry.keypair()?;
            if !seen.insert(keypair.address()) {
                bail!("Duplicate validator {}", entry.address);
            }
        }
        self.validator_changes()?;
        Ok(())
    }

    /// Scheduled membership changes, additions first
    pub fn validator_changes(&self) -> Result<Vec<ValidatorChange>> {
        let added = self
            .add_validators
            .iter()
            .map(|s| -> Result<ValidatorChange> {
                Ok(ValidatorChange::Add(Address::from_hex(s)?))
            });
        let removed = self
            .remove_validators
            .iter()
            .map(|s| -> Result<ValidatorChange> {
                Ok(ValidatorChange::Remove(Address::from_hex(s)?))
            });
        added.chain(removed).collect()
    }

    /// Validator keys sorted by address
    pub fn keypairs(&self) -> Result<Vec<KeyPair>> {
        let mut keys = self
            .validators
            .iter()
            .map(ValidatorEntry::keypair)
            .collect::<Result<Vec<_>>>()?;
        keys.sort_by_key(|k| k.address());
        Ok(keys)
    }

    /// Genesis block config listing every validator in `extra`
    pub fn to_genesis_config(&self) -> Result<GenesisConfig> {
        let addresses: Vec<Address> = self.keypairs()?.iter().map(|k| k.address()).collect();
        Ok(GenesisConfig {
            chain_id: self.chain_id,
            timestamp: self.genesis_timestamp,
            extra: encode_validators(&addresses),
        })
    }
}

/// Generate a devnet configuration with `validators` fresh keys
pub fn generate_devnet_config(validators: usize) -> NodeConfig {
    let genesis_timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    NodeConfig {
        chain_id: 1,
        genesis_timestamp,
        validators: (0..validators)
            .map(|_| ValidatorEntry::from_keypair(&KeyPair::generate()))
            .collect(),
        consensus: Config::default(),
        tx_interval_ms: default_tx_interval_ms(),
        max_block_txs: default_max_block_txs(),
        pool_max_size: default_pool_max_size(),
        add_validators: Vec::new(),
        remove_validators: Vec::new(),
    }
}
