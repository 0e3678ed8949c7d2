// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Binary layouts of SC calls carried by Chain-E deposits and parked in the SC proxy.

use crate::encoding::{be_bytes_to_u64, minimal_be_bytes};
use crate::types::KAddress;
use ethers::types::{Address as EthAddress, U256};

pub const MISSING_DATA_MARKER: u8 = 0x00;
pub const DATA_PRESENT_MARKER: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallDataError {
    #[error("empty call data")]
    Empty,
    #[error("call data carries no SC call")]
    Missing,
    #[error("unexpected marker {0:#04x}")]
    UnexpectedMarker(u8),
    #[error("buffer too short reading {field}: need {needed} bytes, have {available}")]
    TooShort {
        field: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("{0} trailing bytes after call data")]
    TrailingBytes(usize),
    #[error("function name is not valid utf-8")]
    InvalidFunction,
    #[error("amount is longer than 32 bytes")]
    AmountOverflow,
}

/// A smart-contract invocation requested by a depositor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallData {
    pub function: String,
    pub gas_limit: u64,
    pub arguments: Option<Vec<Vec<u8>>>,
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], CallDataError> {
        if self.buf.len() < n {
            return Err(CallDataError::TooShort {
                field,
                needed: n,
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, CallDataError> {
        Ok(self.take(field, 1)?[0])
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, CallDataError> {
        let bytes = self.take(field, 4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, CallDataError> {
        let bytes = self.take(field, 8)?;
        let mut array = [0u8; 8];
        array.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(array))
    }

    fn sized(&mut self, field: &'static str) -> Result<&'a [u8], CallDataError> {
        let len = self.u32(field)? as usize;
        self.take(field, len)
    }

    fn finish(self) -> Result<(), CallDataError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CallDataError::TrailingBytes(self.buf.len()))
        }
    }
}

fn put_sized(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// `0x01 | u32 len | function | u64 gas | arguments marker [| u32 count | (u32 len | arg)*]`
pub fn encode_call_data(call: &CallData) -> Vec<u8> {
    let mut out = vec![DATA_PRESENT_MARKER];
    put_sized(&mut out, call.function.as_bytes());
    out.extend_from_slice(&call.gas_limit.to_be_bytes());
    match &call.arguments {
        None => out.push(MISSING_DATA_MARKER),
        Some(arguments) => {
            out.push(DATA_PRESENT_MARKER);
            out.extend_from_slice(&(arguments.len() as u32).to_be_bytes());
            for argument in arguments {
                put_sized(&mut out, argument);
            }
        }
    }
    out
}

pub fn decode_call_data(buf: &[u8]) -> Result<CallData, CallDataError> {
    let mut reader = Reader::new(buf);
    match reader.u8("marker").map_err(|_| CallDataError::Empty)? {
        DATA_PRESENT_MARKER => {}
        MISSING_DATA_MARKER => return Err(CallDataError::Missing),
        other => return Err(CallDataError::UnexpectedMarker(other)),
    }
    let function = std::str::from_utf8(reader.sized("function")?)
        .map_err(|_| CallDataError::InvalidFunction)?
        .to_string();
    let gas_limit = reader.u64("gas limit")?;
    let arguments = match reader.u8("arguments marker")? {
        MISSING_DATA_MARKER => None,
        DATA_PRESENT_MARKER => {
            let count = reader.u32("argument count")?;
            let mut arguments = Vec::new();
            for _ in 0..count {
                arguments.push(reader.sized("argument")?.to_vec());
            }
            Some(arguments)
        }
        other => return Err(CallDataError::UnexpectedMarker(other)),
    };
    reader.finish()?;
    Ok(CallData {
        function,
        gas_limit,
        arguments,
    })
}

/// Reads only the declared gas limit, ignoring the rest of the payload.
pub fn extract_gas_limit(buf: &[u8]) -> Result<u64, CallDataError> {
    let mut reader = Reader::new(buf);
    match reader.u8("marker").map_err(|_| CallDataError::Empty)? {
        DATA_PRESENT_MARKER => {}
        MISSING_DATA_MARKER => return Err(CallDataError::Missing),
        other => return Err(CallDataError::UnexpectedMarker(other)),
    }
    reader.sized("function")?;
    reader.u64("gas limit")
}

/// One pending operation as stored by the SC proxy contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySCCompleteCallData {
    pub from: EthAddress,
    // An all-zero recipient means the deposit named none
    pub to: Option<KAddress>,
    pub token: String,
    pub amount: U256,
    pub nonce: u64,
    pub raw_call_data: Vec<u8>,
}

impl ProxySCCompleteCallData {
    /// `from(20) | to(32) | u32 len | token | u32 len | amount | u64 nonce | u32 len | call data`
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(80 + self.token.len() + self.raw_call_data.len());
        out.extend_from_slice(self.from.as_bytes());
        out.extend_from_slice(self.to.unwrap_or(KAddress::ZERO).as_bytes());
        put_sized(&mut out, self.token.as_bytes());
        put_sized(&mut out, &minimal_be_bytes(self.amount));
        out.extend_from_slice(&self.nonce.to_be_bytes());
        put_sized(&mut out, &self.raw_call_data);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CallDataError> {
        let mut reader = Reader::new(buf);
        let from = EthAddress::from_slice(reader.take("from", 20)?);
        let mut to = [0u8; 32];
        to.copy_from_slice(reader.take("to", 32)?);
        let to = KAddress::new(to);
        let token = String::from_utf8_lossy(reader.sized("token")?).into_owned();
        let amount = reader.sized("amount")?;
        if amount.len() > 32 {
            return Err(CallDataError::AmountOverflow);
        }
        let amount = U256::from_big_endian(amount);
        let nonce = reader.u64("nonce")?;
        let raw_call_data = reader.sized("call data")?.to_vec();
        reader.finish()?;
        Ok(Self {
            from,
            to: (!to.is_zero()).then_some(to),
            token,
            amount,
            nonce,
            raw_call_data,
        })
    }

    pub fn call_data(&self) -> Result<CallData, CallDataError> {
        decode_call_data(&self.raw_call_data)
    }
}

impl std::fmt::Display for ProxySCCompleteCallData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "from {:?} to {} token {} amount {} nonce {}",
            self.from,
            self.to
                .map(|to| to.to_bech32())
                .unwrap_or_else(|| "<none>".to_string()),
            self.token,
            self.amount,
            self.nonce
        )
    }
}

/// Splits a `getPendingTransactions` response into `(id, call data)` pairs.
pub fn parse_pending_transactions(
    results: &[Vec<u8>],
) -> crate::error::BridgeResult<Vec<(u64, ProxySCCompleteCallData)>> {
    use crate::error::BridgeError;

    if results.len() % 2 != 0 {
        return Err(BridgeError::Decode(format!(
            "pending transactions response has odd length {}",
            results.len()
        )));
    }
    results
        .chunks(2)
        .map(|pair| {
            let id = be_bytes_to_u64(&pair[0])?;
            let call = ProxySCCompleteCallData::decode(&pair[1]).map_err(|e| {
                BridgeError::Decode(format!("pending operation {}: {}", id, e))
            })?;
            Ok((id, call))
        })
        .collect()
}
