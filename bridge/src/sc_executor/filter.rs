// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use super::call_data::ProxySCCompleteCallData;
use crate::config::PendingOperationsFilterConfig;
use crate::types::{parse_eth_address, KAddress};
use ethers::types::Address as EthAddress;
use std::collections::HashSet;
use tracing::debug;

pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterConfigError {
    #[error("wildcard is not allowed in {0}")]
    WildcardInDenyList(&'static str),
    #[error("invalid Chain-E address {item} in {list}")]
    InvalidEthAddress { list: &'static str, item: String },
    #[error("invalid Chain-K address {item} in {list}")]
    InvalidKAddress { list: &'static str, item: String },
    #[error("empty item in {0}")]
    EmptyItem(&'static str),
    #[error("all allowed lists are empty, no pending operation could ever be executed")]
    NoAllowedEntries,
}

#[derive(Debug, Clone, Default)]
struct MatchList<T> {
    wildcard: bool,
    items: HashSet<T>,
}

impl<T: std::hash::Hash + Eq> MatchList<T> {
    fn matches(&self, item: &T) -> bool {
        self.wildcard || self.items.contains(item)
    }

    fn is_empty(&self) -> bool {
        !self.wildcard && self.items.is_empty()
    }
}

fn build_list<T, F>(
    list: &'static str,
    raw: &[String],
    wildcard_allowed: bool,
    parse: F,
) -> Result<MatchList<T>, FilterConfigError>
where
    T: std::hash::Hash + Eq,
    F: Fn(&str) -> Option<T>,
{
    let mut out = MatchList {
        wildcard: false,
        items: HashSet::new(),
    };
    for item in raw {
        let item = item.trim();
        if item.is_empty() {
            return Err(FilterConfigError::EmptyItem(list));
        }
        if item == WILDCARD {
            if !wildcard_allowed {
                return Err(FilterConfigError::WildcardInDenyList(list));
            }
            out.wildcard = true;
            continue;
        }
        let parsed = parse(item).ok_or_else(|| match list {
            "allowed-eth-addresses" | "denied-eth-addresses" => {
                FilterConfigError::InvalidEthAddress {
                    list,
                    item: item.to_string(),
                }
            }
            _ => FilterConfigError::InvalidKAddress {
                list,
                item: item.to_string(),
            },
        })?;
        out.items.insert(parsed);
    }
    Ok(out)
}

/// Allow/deny rules applied to every pending SC call before it is executed.
#[derive(Debug, Clone)]
pub struct PendingOperationFilter {
    allowed_eth: MatchList<EthAddress>,
    denied_eth: MatchList<EthAddress>,
    allowed_k: MatchList<KAddress>,
    denied_k: MatchList<KAddress>,
    allowed_tokens: MatchList<String>,
    denied_tokens: MatchList<String>,
}

impl PendingOperationFilter {
    pub fn new(config: &PendingOperationsFilterConfig) -> Result<Self, FilterConfigError> {
        let eth = |s: &str| parse_eth_address(s).ok();
        let k = |s: &str| KAddress::from_bech32(s).ok();
        let token = |s: &str| Some(s.to_string());

        let filter = Self {
            allowed_eth: build_list("allowed-eth-addresses", &config.allowed_eth_addresses, true, eth)?,
            denied_eth: build_list("denied-eth-addresses", &config.denied_eth_addresses, false, eth)?,
            allowed_k: build_list("allowed-k-addresses", &config.allowed_k_addresses, true, k)?,
            denied_k: build_list("denied-k-addresses", &config.denied_k_addresses, false, k)?,
            allowed_tokens: build_list("allowed-tokens", &config.allowed_tokens, true, token)?,
            denied_tokens: build_list("denied-tokens", &config.denied_tokens, false, token)?,
        };
        if filter.allowed_eth.is_empty()
            && filter.allowed_k.is_empty()
            && filter.allowed_tokens.is_empty()
        {
            return Err(FilterConfigError::NoAllowedEntries);
        }
        Ok(filter)
    }

    pub fn should_execute(&self, call: &ProxySCCompleteCallData) -> bool {
        let Some(to) = call.to else {
            debug!("[SCExecutor] Pending operation {} has no recipient", call.nonce);
            return false;
        };

        if self.denied_eth.matches(&call.from)
            || self.denied_k.matches(&to)
            || self.denied_tokens.matches(&call.token)
        {
            return false;
        }

        self.allowed_eth.matches(&call.from)
            || self.allowed_k.matches(&to)
            || self.allowed_tokens.matches(&call.token)
    }
}
