// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Key material for relayers: the Chain-E secp256k1 key and the Chain-K ed25519 key.
//!
//! Key files hold a raw 32-byte secret, hex (optionally `0x`-prefixed) or base64 encoded.

use anyhow::{anyhow, Result};
use base64::Engine;
use bech32::{ToBase32, Variant};
use std::path::Path;

pub use ethers::signers::LocalWallet;
pub use fastcrypto::ed25519::Ed25519KeyPair;

/// Human readable part of Chain-K bech32 addresses.
pub const K_ADDRESS_HRP: &str = "klv";

pub const SECRET_KEY_LENGTH: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyScheme {
    Secp256k1,
    Ed25519,
}

pub fn decode_secret(contents: &str) -> Result<[u8; SECRET_KEY_LENGTH]> {
    let contents = contents.trim();
    let stripped = contents.strip_prefix("0x").unwrap_or(contents);
    let bytes = match hex::decode(stripped) {
        Ok(bytes) => bytes,
        Err(_) => base64::engine::general_purpose::STANDARD
            .decode(contents)
            .map_err(|_| anyhow!("Key is neither hex nor base64 encoded"))?,
    };
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("Expected a {} byte secret, got {}", SECRET_KEY_LENGTH, bytes.len()))
}

pub fn read_secret<P: AsRef<Path>>(path: P) -> Result<[u8; SECRET_KEY_LENGTH]> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(anyhow!("Key file not found at path: {:?}", path));
    }
    let contents = std::fs::read_to_string(path)?;
    decode_secret(&contents).map_err(|e| anyhow!("Invalid key file {:?}: {}", path, e))
}

pub fn eth_wallet_from_secret(secret: &[u8; SECRET_KEY_LENGTH]) -> Result<LocalWallet> {
    LocalWallet::from_bytes(secret).map_err(|e| anyhow!("Invalid secp256k1 secret: {}", e))
}

pub fn k_keypair_from_secret(secret: &[u8; SECRET_KEY_LENGTH]) -> Result<Ed25519KeyPair> {
    use fastcrypto::ed25519::Ed25519PrivateKey;
    use fastcrypto::traits::ToFromBytes;

    let private = Ed25519PrivateKey::from_bytes(secret)
        .map_err(|e| anyhow!("Invalid ed25519 secret: {}", e))?;
    Ok(Ed25519KeyPair::from(private))
}

pub fn read_eth_key<P: AsRef<Path>>(path: P) -> Result<LocalWallet> {
    eth_wallet_from_secret(&read_secret(path)?)
}

pub fn read_k_key<P: AsRef<Path>>(path: P) -> Result<Ed25519KeyPair> {
    k_keypair_from_secret(&read_secret(path)?)
}

/// bech32 `klv1...` address of a Chain-K account public key.
pub fn k_address_from_pubkey(pubkey: &[u8]) -> Result<String> {
    bech32::encode(K_ADDRESS_HRP, pubkey.to_base32(), Variant::Bech32)
        .map_err(|e| anyhow!("Failed to encode address: {}", e))
}

pub mod keygen {
    use super::*;
    use ethers::signers::Signer;
    use fastcrypto::traits::{KeyPair, ToFromBytes};
    use rand::RngCore;

    pub fn random_secret() -> [u8; SECRET_KEY_LENGTH] {
        let mut secret = [0u8; SECRET_KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut secret);
        secret
    }

    /// Writes a fresh hex encoded secret and returns the public identity it controls:
    /// the `0x` address for secp256k1, the `klv1` address for ed25519.
    pub fn generate_key_and_write_to_file<P: AsRef<Path>>(
        path: P,
        scheme: KeyScheme,
    ) -> Result<String> {
        let path = path.as_ref();
        let (secret, identity) = loop {
            let secret = random_secret();
            // A random 32 byte string can fall outside the secp256k1 scalar range.
            match describe_secret(&secret, scheme) {
                Ok(identity) => break (secret, identity),
                Err(e) => tracing::debug!("Discarding generated secret: {}", e),
            }
        };
        std::fs::write(path, hex::encode(secret))
            .map_err(|err| anyhow!("Failed to write key to {:?}: {}", path, err))?;
        tracing::debug!("Key written to: {:?}", path);
        Ok(identity)
    }

    pub fn describe_secret(secret: &[u8; SECRET_KEY_LENGTH], scheme: KeyScheme) -> Result<String> {
        match scheme {
            KeyScheme::Secp256k1 => {
                let wallet = eth_wallet_from_secret(secret)?;
                Ok(format!("{:?}", wallet.address()))
            }
            KeyScheme::Ed25519 => {
                let kp = k_keypair_from_secret(secret)?;
                k_address_from_pubkey(kp.public().as_bytes())
            }
        }
    }
}
