use std::path::PathBuf;

use anyhow::Result;
use bosphor_consensus::{encode_validators, extract_validators};
use bosphor_core::{Address, KeyPair};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod backend;
mod chain;
mod cli;
mod config;
mod network;
mod node;
mod pool;

use cli::{Cli, Commands, ExtraCommands};
use config::{generate_devnet_config, NodeConfig};
use node::Devnet;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default level
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .pretty()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, blocks } => {
            run_devnet(config, blocks).await?;
        }
        Commands::Init { output, validators } => {
            init_config(output, validators)?;
        }
        Commands::Keygen { output } => {
            generate_keypair(output)?;
        }
        Commands::Extra { command } => {
            handle_extra(command)?;
        }
    }

    Ok(())
}

/// Run the devnet described by a configuration file
async fn run_devnet(config_path: PathBuf, blocks: Option<u64>) -> Result<()> {
    info!("Loading configuration from {:?}", config_path);

    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        error!(
            "Configuration file not found: {:?}. Run 'bosphor init' to create one.",
            config_path
        );
        return Err(anyhow::anyhow!("Configuration file not found"));
    };

    let mut devnet = Devnet::new(config)?;
    let height = devnet.run(blocks).await?;
    println!("Devnet reached height {}", height);

    Ok(())
}

/// Write a devnet configuration with fresh validator keys
fn init_config(output: PathBuf, validators: usize) -> Result<()> {
    info!("Generating devnet configuration with {} validators", validators);

    let config = generate_devnet_config(validators);
    config.validate()?;
    config.save(&output)?;

    info!("Configuration saved to {:?}", output);
    for entry in &config.validators {
        info!("  Validator: {}", entry.address);
    }

    println!("\nConfiguration file created: {}", output.display());
    println!("\nTo start the devnet, run:");
    println!("  bosphor run --config {}", output.display());

    Ok(())
}

/// Generate a new keypair
fn generate_keypair(output: Option<PathBuf>) -> Result<()> {
    let keypair = KeyPair::generate();

    println!("Generated new keypair:");
    println!("  Address:     {}", keypair.address());
    println!("  Public key:  {}", keypair.public.to_hex());
    println!("  Secret key:  {}", keypair.secret.to_hex());

    if let Some(path) = output {
        std::fs::write(&path, keypair.secret.to_hex())?;
        info!("Secret key saved to {:?}", path);
    }

    println!("\nWARNING: Keep your secret key safe! Do not share it with anyone.");

    Ok(())
}

fn handle_extra(command: ExtraCommands) -> Result<()> {
    match command {
        ExtraCommands::Encode { addresses } => {
            let addresses = addresses
                .iter()
                .map(|s| Address::from_hex(s).map_err(anyhow::Error::from))
                .collect::<Result<Vec<_>>>()?;
            println!("{}", hex::encode(encode_validators(&addresses)));
        }
        ExtraCommands::Decode { extra } => {
            let bytes = hex::decode(extra.trim_start_matches("0x"))?;
            for address in extract_validators(&bytes)? {
                println!("{}", address);
            }
        }
    }
    Ok(())
}
