// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Canonical digests signed by relayers and the argument encoding of Chain-K SC calls.

use crate::error::{BridgeError, BridgeResult};
use crate::types::{Batch, ChainKind, DepositStatus};
use ethers::abi::{encode, Token};
use ethers::types::{Address as EthAddress, H256, U256};
use ethers::utils::keccak256;

pub const ETH_SIGNED_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";
pub const K_SIGNED_MESSAGE_PREFIX: &[u8] = b"\x19Klever Signed Message:\n32";

pub const TRANSFER_ACTION_TAG: &str = "ExecuteBatchedTransfer";
pub const SET_STATUS_ACTION_TAG: &str = "CurrentPendingBatch";

pub fn signed_message_prefix(chain: ChainKind) -> &'static [u8] {
    match chain {
        ChainKind::Eth => ETH_SIGNED_MESSAGE_PREFIX,
        ChainKind::K => K_SIGNED_MESSAGE_PREFIX,
    }
}

/// `keccak256(prefix || inner)`, the digest actually signed for `chain`.
pub fn prefixed_message_hash(chain: ChainKind, inner: &[u8; 32]) -> H256 {
    let prefix = signed_message_prefix(chain);
    let mut bytes = Vec::with_capacity(prefix.len() + inner.len());
    bytes.extend_from_slice(prefix);
    bytes.extend_from_slice(inner);
    H256::from(keccak256(bytes))
}

fn recipient_token(bytes: &[u8]) -> BridgeResult<Token> {
    match bytes.len() {
        20 => Ok(Token::Address(EthAddress::from_slice(bytes))),
        32 => Ok(Token::FixedBytes(bytes.to_vec())),
        len => Err(BridgeError::Decode(format!(
            "recipient must be 20 or 32 bytes, got {}",
            len
        ))),
    }
}

fn asset_token(bytes: &[u8]) -> BridgeResult<Token> {
    if bytes.is_empty() {
        return Err(BridgeError::UnknownToken(
            "destination token was not resolved".to_string(),
        ));
    }
    if bytes.len() == 20 {
        Ok(Token::Address(EthAddress::from_slice(bytes)))
    } else {
        Ok(Token::Bytes(bytes.to_vec()))
    }
}

/// Message hash of a transfer batch executed on `destination`.
///
/// Deposit order inside the batch is canonical; the arrays are built in that order.
/// Every deposit must already carry its resolved destination token.
pub fn transfer_message_hash(destination: ChainKind, batch: &Batch) -> BridgeResult<H256> {
    let mut recipients = Vec::with_capacity(batch.deposits.len());
    let mut tokens = Vec::with_capacity(batch.deposits.len());
    let mut amounts = Vec::with_capacity(batch.deposits.len());
    for deposit in &batch.deposits {
        recipients.push(recipient_token(&deposit.to)?);
        tokens.push(asset_token(&deposit.destination_token)?);
        amounts.push(Token::Uint(deposit.transfer_amount()));
    }
    let inner = keccak256(encode(&[
        Token::Array(recipients),
        Token::Array(tokens),
        Token::Array(amounts),
        Token::Uint(U256::from(batch.batch_id)),
        Token::String(TRANSFER_ACTION_TAG.to_string()),
    ]));
    Ok(prefixed_message_hash(destination, &inner))
}

/// Message hash of the status update closing `batch_id` on `target`.
pub fn set_status_message_hash(target: ChainKind, batch_id: u64, statuses: &[DepositStatus]) -> H256 {
    let statuses = statuses
        .iter()
        .map(|s| Token::Uint(U256::from(u8::from(*s))))
        .collect();
    let inner = keccak256(encode(&[
        Token::Uint(U256::from(batch_id)),
        Token::Array(statuses),
        Token::String(SET_STATUS_ACTION_TAG.to_string()),
    ]));
    prefixed_message_hash(target, &inner)
}

/// Builds the `function@hexarg@hexarg` data field of a Chain-K SC call.
#[derive(Clone, Debug, Default)]
pub struct KCallBuilder {
    function: String,
    args: Vec<String>,
}

impl KCallBuilder {
    pub fn new(function: &str) -> Self {
        Self {
            function: function.to_string(),
            args: vec![],
        }
    }

    pub fn arg_bytes(mut self, bytes: &[u8]) -> Self {
        self.args.push(hex::encode(bytes));
        self
    }

    pub fn arg_u64(self, value: u64) -> Self {
        self.arg_biguint(U256::from(value))
    }

    /// Minimal big endian encoding, zero encodes as an empty argument.
    pub fn arg_biguint(self, value: U256) -> Self {
        let bytes = minimal_be_bytes(value);
        self.arg_bytes(&bytes)
    }

    pub fn arg_str(self, value: &str) -> Self {
        self.arg_bytes(value.as_bytes())
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn build(self) -> Vec<u8> {
        let mut data = self.function;
        for arg in self.args {
            data.push('@');
            data.push_str(&arg);
        }
        data.into_bytes()
    }

    pub fn hex_args(&self) -> &[String] {
        &self.args
    }
}

pub fn minimal_be_bytes(value: U256) -> Vec<u8> {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    let first = buf.iter().position(|b| *b != 0).unwrap_or(buf.len());
    buf[first..].to_vec()
}

/// Decodes a big endian unsigned integer returned by a VM query; empty means zero.
pub fn be_bytes_to_u64(bytes: &[u8]) -> BridgeResult<u64> {
    if bytes.len() > 8 {
        return Err(BridgeError::Decode(format!(
            "{} bytes do not fit a u64",
            bytes.len()
        )));
    }
    let mut buf = [0u8; 8];
    buf[8 - bytes.len()..].copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

pub fn be_bytes_to_u256(bytes: &[u8]) -> BridgeResult<U256> {
    if bytes.len() > 32 {
        return Err(BridgeError::Decode(format!(
            "{} bytes do not fit a u256",
            bytes.len()
        )));
    }
    Ok(U256::from_big_endian(bytes))
}

/// VM queries encode booleans as `0x01` for true and an empty slice for false.
pub fn be_bytes_to_bool(bytes: &[u8]) -> bool {
    bytes.iter().any(|b| *b != 0)
}
