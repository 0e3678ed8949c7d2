// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Signers own the private keys; callers only ever see signatures.

use crate::error::{BridgeError, BridgeResult};
use crate::types::{ChainKind, KAddress, KTransaction};
use ethers::signers::{LocalWallet, Signer as _};
use ethers::types::{Address as EthAddress, Signature as EthSignature, H256};
use fastcrypto::ed25519::{Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature};
use fastcrypto::traits::{KeyPair, Signer, ToFromBytes, VerifyingKey};
use std::sync::Arc;

/// Signs the canonical message hash of an action targeting `chain`.
pub trait MessageSigner: Send + Sync {
    fn chain(&self) -> ChainKind;
    fn sign_message_hash(&self, message_hash: &H256) -> BridgeResult<Vec<u8>>;
}

pub struct EthMessageSigner {
    wallet: LocalWallet,
}

impl EthMessageSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    pub fn address(&self) -> EthAddress {
        self.wallet.address()
    }
}

impl MessageSigner for EthMessageSigner {
    fn chain(&self) -> ChainKind {
        ChainKind::Eth
    }

    // 65 bytes r || s || v with v in {27, 28}
    fn sign_message_hash(&self, message_hash: &H256) -> BridgeResult<Vec<u8>> {
        let signature = self
            .wallet
            .sign_hash(*message_hash)
            .map_err(|e| BridgeError::Generic(format!("failed to sign message hash: {}", e)))?;
        Ok(signature.to_vec())
    }
}

pub struct KMessageSigner {
    keypair: Arc<Ed25519KeyPair>,
}

impl KMessageSigner {
    pub fn new(keypair: Arc<Ed25519KeyPair>) -> Self {
        Self { keypair }
    }
}

impl MessageSigner for KMessageSigner {
    fn chain(&self) -> ChainKind {
        ChainKind::K
    }

    fn sign_message_hash(&self, message_hash: &H256) -> BridgeResult<Vec<u8>> {
        let signature: Ed25519Signature = self.keypair.sign(message_hash.as_bytes());
        Ok(signature.as_bytes().to_vec())
    }
}

/// Signs Chain-K transactions for one sender address.
pub struct KTxSigner {
    keypair: Arc<Ed25519KeyPair>,
    address: KAddress,
}

impl KTxSigner {
    pub fn new(keypair: Arc<Ed25519KeyPair>) -> BridgeResult<Self> {
        let address = KAddress::from_slice(keypair.public().as_bytes())?;
        Ok(Self { keypair, address })
    }

    pub fn address(&self) -> &KAddress {
        &self.address
    }

    pub fn sign_transaction(&self, tx: &mut KTransaction) -> BridgeResult<()> {
        let bytes = tx.signing_bytes()?;
        let signature: Ed25519Signature = self.keypair.sign(&bytes);
        tx.signature = Some(hex::encode(signature.as_bytes()));
        Ok(())
    }
}

pub const ED25519_SIGNATURE_LENGTH: usize = 64;
pub const ETH_SIGNATURE_LENGTH: usize = 65;

pub fn ed25519_public_key_bytes(keypair: &Ed25519KeyPair) -> Vec<u8> {
    keypair.public().as_bytes().to_vec()
}

pub fn sign_ed25519(keypair: &Ed25519KeyPair, message: &[u8]) -> Vec<u8> {
    let signature: Ed25519Signature = keypair.sign(message);
    signature.as_bytes().to_vec()
}

pub fn verify_ed25519(pubkey: &[u8], message: &[u8], signature: &[u8]) -> BridgeResult<()> {
    let pubkey = Ed25519PublicKey::from_bytes(pubkey)
        .map_err(|e| BridgeError::PeerProtocolViolation(format!("invalid public key: {}", e)))?;
    let signature = Ed25519Signature::from_bytes(signature)
        .map_err(|e| BridgeError::PeerProtocolViolation(format!("invalid signature: {}", e)))?;
    pubkey
        .verify(message, &signature)
        .map_err(|e| BridgeError::PeerProtocolViolation(format!("bad signature: {}", e)))
}

/// Address whose key produced `signature` over the raw `message_hash`.
pub fn recover_eth_signer(message_hash: &H256, signature: &[u8]) -> BridgeResult<EthAddress> {
    let signature = EthSignature::try_from(signature)
        .map_err(|e| BridgeError::PeerProtocolViolation(format!("invalid signature: {}", e)))?;
    signature
        .recover(*message_hash)
        .map_err(|e| BridgeError::PeerProtocolViolation(format!("bad signature: {}", e)))
}
