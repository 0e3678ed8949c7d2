// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::sc_executor::filter::PendingOperationFilter;
use crate::types::{parse_eth_address, KAddress};
use anyhow::anyhow;
use ethers::signers::LocalWallet;
use ethers::types::Address as EthAddress;
use fastcrypto::ed25519::Ed25519KeyPair;
use klever_bridge_config::Config;
use klever_bridge_keys::{read_eth_key, read_k_key};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Lowest gas any SC call may be bounded with.
pub const MIN_GAS_LIMIT_FOR_SC_CALLS: u64 = 2_010_000;
/// Gas above this makes the destination contract refund instead of executing.
pub const CONTRACT_MAX_GAS_LIMIT: u64 = 249_999_999;

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct GasStationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub polling_interval_s: u64,
    #[serde(default)]
    pub max_fetch_retries: u32,
    // wei; 0 disables the cap
    #[serde(default)]
    pub max_gas_price: u64,
    #[serde(default)]
    pub gas_price_selector: String,
    #[serde(default = "default_gas_price_multiplier")]
    pub gas_price_multiplier: u64,
}

fn default_gas_price_multiplier() -> u64 {
    1
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EthConfig {
    // Rpc url of the Chain-E node
    pub network_address: String,
    pub safe_contract: String,
    pub multisig_contract: String,
    // secp256k1 key used to sign batches and send execute txs
    pub private_key_file: PathBuf,
    pub chain_id: u64,
    pub gas_limit_base: u64,
    pub gas_limit_for_each: u64,
    #[serde(default)]
    pub gas_station: GasStationConfig,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestApiEntityType {
    #[default]
    Proxy,
    Observer,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct KProxyConfig {
    #[serde(default = "default_true")]
    pub finality_check: bool,
    #[serde(default = "default_max_nonces_delta")]
    pub max_nonces_delta: u64,
    #[serde(default = "default_cacher_expiration_s")]
    pub cacher_expiration_s: u64,
    #[serde(default)]
    pub rest_api_entity_type: RestApiEntityType,
}

fn default_max_nonces_delta() -> u64 {
    7
}

fn default_cacher_expiration_s() -> u64 {
    600
}

impl Default for KProxyConfig {
    fn default() -> Self {
        Self {
            finality_check: true,
            max_nonces_delta: default_max_nonces_delta(),
            cacher_expiration_s: default_cacher_expiration_s(),
            rest_api_entity_type: RestApiEntityType::Proxy,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct KGasMapConfig {
    pub sign: u64,
    pub propose_transfer_base: u64,
    pub propose_transfer_for_each: u64,
    pub propose_status_base: u64,
    pub propose_status_for_each: u64,
    pub perform_action_base: u64,
    pub perform_action_for_each: u64,
    pub sc_call_per_byte: u64,
    pub sc_call_perform_for_each: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct KConfig {
    // Base url of the Chain-K proxy
    pub network_address: String,
    pub safe_contract: String,
    pub multisig_contract: String,
    // ed25519 key for Chain-K txs; also the relayer's gossip identity
    pub private_key_file: PathBuf,
    // Attached to every tx when the proxy does not report one
    #[serde(default)]
    pub chain_id: String,
    #[serde(default)]
    pub proxy: KProxyConfig,
    pub gas_map: KGasMapConfig,
    pub interval_to_resend_txs_s: u64,
    pub client_availability_allow_delta: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PendingOperationsFilterConfig {
    #[serde(default)]
    pub denied_eth_addresses: Vec<String>,
    #[serde(default)]
    pub allowed_eth_addresses: Vec<String>,
    #[serde(default)]
    pub denied_k_addresses: Vec<String>,
    #[serde(default)]
    pub allowed_k_addresses: Vec<String>,
    #[serde(default)]
    pub denied_tokens: Vec<String>,
    #[serde(default)]
    pub allowed_tokens: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransactionChecksConfig {
    #[serde(default)]
    pub check_transaction_results: bool,
    #[serde(default = "default_time_between_checks_s")]
    pub time_between_checks_s: u64,
    #[serde(default = "default_tx_execution_timeout_s")]
    pub execution_timeout_s: u64,
    #[serde(default)]
    pub close_app_on_error: bool,
    #[serde(default)]
    pub extra_delay_on_error_s: u64,
}

fn default_time_between_checks_s() -> u64 {
    6
}

fn default_tx_execution_timeout_s() -> u64 {
    120
}

impl Default for TransactionChecksConfig {
    fn default() -> Self {
        Self {
            check_transaction_results: false,
            time_between_checks_s: default_time_between_checks_s(),
            execution_timeout_s: default_tx_execution_timeout_s(),
            close_app_on_error: false,
            extra_delay_on_error_s: 0,
        }
    }
}

impl TransactionChecksConfig {
    pub fn time_between_checks(&self) -> Duration {
        Duration::from_secs(self.time_between_checks_s)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_s)
    }

    pub fn extra_delay_on_error(&self) -> Duration {
        Duration::from_secs(self.extra_delay_on_error_s)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScCallsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub sc_proxy_address: String,
    // Executor key; defaults to the relayer's Chain-K key
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,
    pub extra_gas_to_execute: u64,
    pub max_gas_limit_to_use: u64,
    pub gas_limit_for_out_of_gas_transactions: u64,
    pub polling_interval_ms: u64,
    #[serde(default)]
    pub filter: PendingOperationsFilterConfig,
    #[serde(default)]
    pub transaction_checks: TransactionChecksConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AntifloodConfig {
    pub max_messages_per_peer_per_sec: u32,
    pub max_bytes_per_peer_per_sec: u64,
    // Bucket capacity as a multiple of the per second rate
    #[serde(default = "default_burst_factor")]
    pub burst_factor: u32,
    pub max_tracked_peers: usize,
    #[serde(default = "default_peer_ttl_s")]
    pub peer_ttl_s: u64,
}

fn default_burst_factor() -> u32 {
    2
}

fn default_peer_ttl_s() -> u64 {
    300
}

impl Default for AntifloodConfig {
    fn default() -> Self {
        Self {
            max_messages_per_peer_per_sec: 100,
            max_bytes_per_peer_per_sec: 1024 * 1024,
            burst_factor: default_burst_factor(),
            max_tracked_peers: 1_000,
            peer_ttl_s: default_peer_ttl_s(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct P2pConfig {
    pub listen_port: u16,
    // Base urls of the other relayers, e.g. http://relayer-2:10010
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_absolute_max_slice_size")]
    pub absolute_max_slice_size: usize,
    #[serde(default = "default_blacklist_ttl_s")]
    pub blacklist_ttl_s: u64,
    // Hex ed25519 public keys, merged with the Chain-K multisig board
    #[serde(default)]
    pub whitelisted_relayers: Vec<String>,
    // Identity announced to peers; defaults to the relayer's klv1 address
    #[serde(default)]
    pub peer_id: Option<String>,
}

fn default_topic() -> String {
    "EthereumToKlever".to_string()
}

fn default_absolute_max_slice_size() -> usize {
    1 << 20
}

fn default_blacklist_ttl_s() -> u64 {
    300
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayerConfig {
    pub tick_interval_ms: u64,
    pub quorum_timeout_ticks: u64,
    pub confirmation_timeout_ticks: u64,
    pub execution_timeout_s: u64,
    #[serde(default = "default_status_check_interval_s")]
    pub status_check_interval_s: u64,
    pub p2p: P2pConfig,
    #[serde(default)]
    pub antiflood: AntifloodConfig,
}

fn default_status_check_interval_s() -> u64 {
    60
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BridgeNodeConfig {
    pub metrics_port: u16,
    pub eth: EthConfig,
    pub k: KConfig,
    pub sc_calls: ScCallsConfig,
    pub relayer: RelayerConfig,
}

impl Config for BridgeNodeConfig {}

/// Everything the node needs after config validation: parsed addresses and loaded keys.
pub struct BridgeRuntimeConfig {
    pub eth_wallet: LocalWallet,
    pub eth_safe: EthAddress,
    pub eth_multisig: EthAddress,
    pub k_keypair: Arc<Ed25519KeyPair>,
    pub executor_keypair: Arc<Ed25519KeyPair>,
    pub k_safe: KAddress,
    pub k_multisig: KAddress,
    pub sc_proxy: KAddress,
    pub whitelisted_relayers: Vec<Vec<u8>>,
    pub filter: PendingOperationFilter,
}

impl BridgeNodeConfig {
    /// Validates every value and loads the key files.
    pub fn validate(&self) -> anyhow::Result<BridgeRuntimeConfig> {
        info!("Starting config validation");
        self.check_values()?;

        let eth_wallet = read_eth_key(&self.eth.private_key_file)?;
        let k_keypair = Arc::new(read_k_key(&self.k.private_key_file)?);
        let executor_keypair = match &self.sc_calls.private_key_file {
            Some(path) if *path != self.k.private_key_file => Arc::new(read_k_key(path)?),
            _ => k_keypair.clone(),
        };
        info!("Loaded relayer keys");

        Ok(BridgeRuntimeConfig {
            eth_wallet,
            eth_safe: parse_eth_address(&self.eth.safe_contract)
                .map_err(|e| anyhow!("eth.safe-contract: {}", e))?,
            eth_multisig: parse_eth_address(&self.eth.multisig_contract)
                .map_err(|e| anyhow!("eth.multisig-contract: {}", e))?,
            k_keypair,
            executor_keypair,
            k_safe: KAddress::from_bech32(&self.k.safe_contract)
                .map_err(|e| anyhow!("k.safe-contract: {}", e))?,
            k_multisig: KAddress::from_bech32(&self.k.multisig_contract)
                .map_err(|e| anyhow!("k.multisig-contract: {}", e))?,
            sc_proxy: KAddress::from_bech32(&self.sc_calls.sc_proxy_address)
                .map_err(|e| anyhow!("sc-calls.sc-proxy-address: {}", e))?,
            whitelisted_relayers: self.whitelisted_relayer_keys()?,
            filter: PendingOperationFilter::new(&self.sc_calls.filter)?,
        })
    }

    /// Checks that do not touch the filesystem.
    pub fn check_values(&self) -> anyhow::Result<()> {
        parse_eth_address(&self.eth.safe_contract)
            .map_err(|e| anyhow!("eth.safe-contract: {}", e))?;
        parse_eth_address(&self.eth.multisig_contract)
            .map_err(|e| anyhow!("eth.multisig-contract: {}", e))?;
        KAddress::from_bech32(&self.k.safe_contract)
            .map_err(|e| anyhow!("k.safe-contract: {}", e))?;
        KAddress::from_bech32(&self.k.multisig_contract)
            .map_err(|e| anyhow!("k.multisig-contract: {}", e))?;
        KAddress::from_bech32(&self.sc_calls.sc_proxy_address)
            .map_err(|e| anyhow!("sc-calls.sc-proxy-address: {}", e))?;

        check_sc_call_gas_limits(&self.sc_calls)?;
        PendingOperationFilter::new(&self.sc_calls.filter)?;
        self.whitelisted_relayer_keys()?;

        if self.k.interval_to_resend_txs_s == 0 {
            return Err(anyhow!("k.interval-to-resend-txs-s must be positive"));
        }
        if self.sc_calls.polling_interval_ms == 0 {
            return Err(anyhow!("sc-calls.polling-interval-ms must be positive"));
        }
        let checks = &self.sc_calls.transaction_checks;
        if checks.check_transaction_results
            && (checks.time_between_checks_s == 0 || checks.execution_timeout_s == 0)
        {
            return Err(anyhow!(
                "sc-calls.transaction-checks intervals must be positive when checks are enabled"
            ));
        }
        if self.relayer.tick_interval_ms == 0 {
            return Err(anyhow!("relayer.tick-interval-ms must be positive"));
        }
        if self.relayer.quorum_timeout_ticks == 0 || self.relayer.confirmation_timeout_ticks == 0 {
            return Err(anyhow!("relayer timeouts must be at least one tick"));
        }
        if self.relayer.execution_timeout_s == 0 {
            return Err(anyhow!("relayer.execution-timeout-s must be positive"));
        }
        if self.relayer.p2p.absolute_max_slice_size == 0 {
            return Err(anyhow!("relayer.p2p.absolute-max-slice-size must be positive"));
        }
        if self.relayer.antiflood.max_messages_per_peer_per_sec == 0
            || self.relayer.antiflood.max_bytes_per_peer_per_sec == 0
        {
            return Err(anyhow!("relayer.antiflood rates must be positive"));
        }
        Ok(())
    }

    pub fn whitelisted_relayer_keys(&self) -> anyhow::Result<Vec<Vec<u8>>> {
        self.relayer
            .p2p
            .whitelisted_relayers
            .iter()
            .map(|key| {
                let bytes = hex::decode(key.trim_start_matches("0x"))
                    .map_err(|e| anyhow!("Invalid whitelisted relayer {}: {}", key, e))?;
                if bytes.len() != 32 {
                    return Err(anyhow!(
                        "Invalid whitelisted relayer {}: expected a 32 byte ed25519 key",
                        key
                    ));
                }
                Ok(bytes)
            })
            .collect()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.relayer.tick_interval_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.relayer.execution_timeout_s)
    }
}

/// Both thresholds share the same absolute minimum; they may be equal.
pub fn check_sc_call_gas_limits(config: &ScCallsConfig) -> anyhow::Result<()> {
    if config.max_gas_limit_to_use < MIN_GAS_LIMIT_FOR_SC_CALLS {
        return Err(anyhow!(
            "sc-calls.max-gas-limit-to-use {} is below the minimum {}",
            config.max_gas_limit_to_use,
            MIN_GAS_LIMIT_FOR_SC_CALLS
        ));
    }
    if config.gas_limit_for_out_of_gas_transactions < MIN_GAS_LIMIT_FOR_SC_CALLS {
        return Err(anyhow!(
            "sc-calls.gas-limit-for-out-of-gas-transactions {} is below the minimum {}",
            config.gas_limit_for_out_of_gas_transactions,
            MIN_GAS_LIMIT_FOR_SC_CALLS
        ));
    }
    if config.extra_gas_to_execute == 0 {
        return Err(anyhow!("sc-calls.extra-gas-to-execute must be positive"));
    }
    Ok(())
}
