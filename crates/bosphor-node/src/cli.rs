use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Bosphor - Istanbul BFT consensus devnet
#[derive(Parser)]
#[command(name = "bosphor")]
#[command(about = "Bosphor devnet and utilities")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an in-process devnet
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,

        /// Stop once every validator has this many blocks
        #[arg(short, long)]
        blocks: Option<u64>,
    },

    /// Initialize a new devnet configuration
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,

        /// Number of validators to generate
        #[arg(short, long, default_value_t = 4)]
        validators: usize,
    },

    /// Generate a new keypair
    Keygen {
        /// Output file for secret key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validator list encoding for header extra data
    Extra {
        #[command(subcommand)]
        command: ExtraCommands,
    },
}

#[derive(Subcommand)]
pub enum ExtraCommands {
    /// Pack validator addresses into extra data hex
    Encode {
        /// Validator addresses (hex)
        #[arg(required = true)]
        addresses: Vec<String>,
    },

    /// Unpack validator addresses from extra data hex
    Decode {
        /// Extra data (hex)
        extra: String,
    },
}
