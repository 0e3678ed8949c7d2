// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::{BridgeError, BridgeResult};
use crate::types::{ChainKind, Direction};
use async_trait::async_trait;
use ethers::types::U256;
use std::sync::Arc;
use tracing::{debug, warn};

/// How a token is held by the safe contract of one chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenSideInfo {
    pub is_native: bool,
    pub is_mint_burn: bool,
    pub total: U256,
    pub mint: U256,
    pub burn: U256,
}

impl TokenSideInfo {
    // Value backing the token on its native chain
    fn locked_value(&self) -> U256 {
        if self.is_mint_burn {
            self.burn.saturating_sub(self.mint)
        } else {
            self.total
        }
    }

    // Value circulating as a wrapped token on the other chain
    fn issued_value(&self) -> U256 {
        self.mint.saturating_sub(self.burn)
    }
}

#[async_trait]
pub trait TokenBalanceSource: Send + Sync {
    fn chain(&self) -> ChainKind;
    async fn token_side_info(&self, token: &[u8]) -> BridgeResult<TokenSideInfo>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("token is neither native nor mint-burn on {0}")]
    UnsupportedToken(ChainKind),
    #[error("token is native on both chains")]
    NativeOnBothChains,
    #[error("token is native on neither chain")]
    NativeOnNeitherChain,
    #[error("{chain} safe holds {available}, transfer needs {needed}")]
    InsufficientLockedBalance {
        chain: ChainKind,
        available: U256,
        needed: U256,
    },
    #[error("native value {native} cannot back issued value {issued} plus {amount}")]
    UnbackedIssuance {
        native: U256,
        issued: U256,
        amount: U256,
    },
}

/// Checks one token of a batch against the safe-side balances of both chains.
pub fn check_balances(
    eth: &TokenSideInfo,
    k: &TokenSideInfo,
    amount: U256,
    direction: Direction,
) -> Result<(), BalanceError> {
    if !eth.is_native && !eth.is_mint_burn {
        return Err(BalanceError::UnsupportedToken(ChainKind::Eth));
    }
    if !k.is_native && !k.is_mint_burn {
        return Err(BalanceError::UnsupportedToken(ChainKind::K));
    }
    match (eth.is_native, k.is_native) {
        (true, true) => return Err(BalanceError::NativeOnBothChains),
        (false, false) => return Err(BalanceError::NativeOnNeitherChain),
        _ => {}
    }

    let (destination_chain, destination) = match direction {
        Direction::EthToK => (ChainKind::K, k),
        Direction::KToEth => (ChainKind::Eth, eth),
    };
    if !destination.is_mint_burn && destination.total < amount {
        return Err(BalanceError::InsufficientLockedBalance {
            chain: destination_chain,
            available: destination.total,
            needed: amount,
        });
    }

    let (native_chain, native, wrapped) = if eth.is_native {
        (ChainKind::Eth, eth, k)
    } else {
        (ChainKind::K, k, eth)
    };
    let native_value = native.locked_value();
    let issued_value = wrapped.issued_value();
    // Moving out of the native chain issues new wrapped tokens
    let needed = if direction.source() == native_chain {
        issued_value.saturating_add(amount)
    } else {
        amount
    };
    if native_value < needed {
        return Err(BalanceError::UnbackedIssuance {
            native: native_value,
            issued: issued_value,
            amount,
        });
    }
    Ok(())
}

pub struct BalanceValidator {
    eth: Arc<dyn TokenBalanceSource>,
    k: Arc<dyn TokenBalanceSource>,
}

impl BalanceValidator {
    pub fn new(eth: Arc<dyn TokenBalanceSource>, k: Arc<dyn TokenBalanceSource>) -> Self {
        Self { eth, k }
    }

    /// `amount` is the cumulative amount of `eth_token` in the batch.
    pub async fn check_token(
        &self,
        eth_token: &[u8],
        k_token: &[u8],
        amount: U256,
        direction: Direction,
    ) -> BridgeResult<()> {
        let (eth_info, k_info) = futures::try_join!(
            self.eth.token_side_info(eth_token),
            self.k.token_side_info(k_token)
        )?;
        debug!(
            "[{}] Balance check for {} / {}: amount {}, eth {:?}, k {:?}",
            direction,
            hex::encode(eth_token),
            String::from_utf8_lossy(k_token),
            amount,
            eth_info,
            k_info
        );
        check_balances(&eth_info, &k_info, amount, direction).map_err(|e| {
            warn!("[{}] Balance validation failed: {}", direction, e);
            BridgeError::BalanceMismatch(e.to_string())
        })
    }
}
