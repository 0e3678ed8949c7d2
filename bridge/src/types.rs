// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::{BridgeError, BridgeResult};
use bech32::{FromBase32, ToBase32, Variant};
use ethers::types::{Address as EthAddress, H256, U256};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use klever_bridge_keys::K_ADDRESS_HRP;

pub const K_ADDRESS_LENGTH: usize = 32;

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    strum_macros::Display,
)]
pub enum ChainKind {
    #[strum(serialize = "eth")]
    Eth,
    #[strum(serialize = "k")]
    K,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Direction {
    #[strum(serialize = "EthToK")]
    EthToK,
    #[strum(serialize = "KToEth")]
    KToEth,
}

impl Direction {
    pub fn source(&self) -> ChainKind {
        match self {
            Direction::EthToK => ChainKind::Eth,
            Direction::KToEth => ChainKind::K,
        }
    }

    pub fn destination(&self) -> ChainKind {
        match self {
            Direction::EthToK => ChainKind::K,
            Direction::KToEth => ChainKind::Eth,
        }
    }
}

/// A Chain-K account address: a 32 byte public key rendered as `klv1...` bech32.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KAddress([u8; K_ADDRESS_LENGTH]);

impl KAddress {
    pub const ZERO: KAddress = KAddress([0u8; K_ADDRESS_LENGTH]);

    pub fn new(bytes: [u8; K_ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> BridgeResult<Self> {
        let bytes: [u8; K_ADDRESS_LENGTH] = bytes.try_into().map_err(|_| {
            BridgeError::InvalidAddress(format!(
                "K address must be {} bytes, got {}",
                K_ADDRESS_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn from_bech32(address: &str) -> BridgeResult<Self> {
        let (hrp, data, variant) = bech32::decode(address)
            .map_err(|e| BridgeError::InvalidAddress(format!("{}: {}", address, e)))?;
        if hrp != K_ADDRESS_HRP || variant != Variant::Bech32 {
            return Err(BridgeError::InvalidAddress(format!(
                "{}: expected a {} bech32 address",
                address, K_ADDRESS_HRP
            )));
        }
        let bytes = Vec::<u8>::from_base32(&data)
            .map_err(|e| BridgeError::InvalidAddress(format!("{}: {}", address, e)))?;
        Self::from_slice(&bytes)
    }

    pub fn to_bech32(&self) -> String {
        // Encoding a 32 byte payload under a fixed, valid HRP cannot fail.
        bech32::encode(K_ADDRESS_HRP, self.0.to_base32(), Variant::Bech32).unwrap_or_default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; K_ADDRESS_LENGTH]
    }
}

impl fmt::Display for KAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_bech32())
    }
}

impl fmt::Debug for KAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KAddress({})", self.to_bech32())
    }
}

impl FromStr for KAddress {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bech32(s)
    }
}

pub fn parse_eth_address(address: &str) -> BridgeResult<EthAddress> {
    if !address.starts_with("0x") {
        return Err(BridgeError::InvalidAddress(format!(
            "{}: Chain-E addresses must start with 0x",
            address
        )));
    }
    EthAddress::from_str(address)
        .map_err(|e| BridgeError::InvalidAddress(format!("{}: {}", address, e)))
}

/// Status of a single deposit as tracked by the source safe contract.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum DepositStatus {
    None = 0,
    Pending = 1,
    InProgress = 2,
    Executed = 3,
    Rejected = 4,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Deposit {
    pub deposit_nonce: u64,
    pub from: Vec<u8>,
    pub to: Vec<u8>,
    pub source_token: Vec<u8>,
    // Filled by the token mapper while validating the batch
    pub destination_token: Vec<u8>,
    pub amount: U256,
    // Fee charged by the source chain, forwarded but never modeled
    pub fee: U256,
    pub call_data: Vec<u8>,
    pub display_from: String,
    pub display_to: String,
    pub display_token: String,
}

impl Deposit {
    /// Amount credited on the destination chain.
    pub fn transfer_amount(&self) -> U256 {
        self.amount.saturating_sub(self.fee)
    }
}

impl fmt::Display for Deposit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deposit {} from {} to {} token {} amount {}",
            self.deposit_nonce, self.display_from, self.display_to, self.display_token, self.amount
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub batch_id: u64,
    pub deposits: Vec<Deposit>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.batch_id == 0 || self.deposits.is_empty()
    }

    pub fn deposit_nonces(&self) -> Vec<u64> {
        self.deposits.iter().map(|d| d.deposit_nonce).collect()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ActionKind {
    Transfer,
    SetStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub batch_id: u64,
    pub message_hash: H256,
    // Assigned by the destination multisig; 0 while it has not seen the proposal yet.
    // Chain-E has no proposal step and reuses the batch id.
    pub action_id: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

/// Inner payload gossiped on the signature topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthereumSignature {
    pub signature: Vec<u8>,
    pub message_hash: Vec<u8>,
}

/// A Chain-K transaction as sent to the proxy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KTransaction {
    pub nonce: u64,
    pub value: String,
    pub receiver: String,
    pub sender: String,
    pub gas_price: u64,
    pub gas_limit: u64,
    #[serde(with = "hex_bytes", default)]
    pub data: Vec<u8>,
    #[serde(rename = "chainID")]
    pub chain_id: String,
    pub version: u32,
    #[serde(default)]
    pub kapp_fee: u64,
    #[serde(default)]
    pub bandwidth_fee: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
}

impl KTransaction {
    pub fn new(sender: &KAddress, receiver: &KAddress, data: Vec<u8>, gas_limit: u64) -> Self {
        Self {
            nonce: 0,
            value: "0".to_string(),
            receiver: receiver.to_bech32(),
            sender: sender.to_bech32(),
            gas_price: 0,
            gas_limit,
            data,
            chain_id: String::new(),
            version: 1,
            kapp_fee: 0,
            bandwidth_fee: 0,
            signature: None,
        }
    }

    pub fn has_same_fees(&self, other: &KTransaction) -> bool {
        self.kapp_fee == other.kapp_fee
            && self.bandwidth_fee == other.bandwidth_fee
            && self.gas_price == other.gas_price
    }

    /// Bytes covered by the sender's signature: the tx without its signature, as JSON.
    pub fn signing_bytes(&self) -> BridgeResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        serde_json::to_vec(&unsigned).map_err(|e| BridgeError::Generic(e.to_string()))
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxFees {
    pub kapp_fee: u64,
    pub bandwidth_fee: u64,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

pub fn h256_from_slice(bytes: &[u8]) -> BridgeResult<H256> {
    if bytes.len() != 32 {
        return Err(BridgeError::Decode(format!(
            "expected a 32 byte hash, got {} bytes",
            bytes.len()
        )));
    }
    Ok(H256::from_slice(bytes))
}
