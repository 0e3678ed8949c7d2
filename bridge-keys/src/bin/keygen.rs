// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{Parser, Subcommand};
use klever_bridge_keys::{keygen, read_secret, KeyScheme};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "klever-bridge-keygen")]
#[command(about = "Generate relayer keys for the Klever bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the Chain-E (secp256k1) key used to sign batches and send Ethereum txs
    Eth {
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Generate the Chain-K (ed25519) key used for K txs and gossip
    K {
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the identity controlled by an existing key file
    Examine {
        path: PathBuf,
        #[arg(long, default_value = "false")]
        eth: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Commands::Eth { output } => {
            let address = keygen::generate_key_and_write_to_file(&output, KeyScheme::Secp256k1)?;
            println!("Key file: {:?}", output);
            println!("Ethereum address: {}", address);
        }
        Commands::K { output } => {
            let address = keygen::generate_key_and_write_to_file(&output, KeyScheme::Ed25519)?;
            println!("Key file: {:?}", output);
            println!("K address: {}", address);
        }
        Commands::Examine { path, eth } => {
            let scheme = if eth {
                KeyScheme::Secp256k1
            } else {
                KeyScheme::Ed25519
            };
            let identity = keygen::describe_secret(&read_secret(&path)?, scheme)?;
            println!("{:?} identity: {}", scheme, identity);
        }
    }
    Ok(())
}
