// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! REST client for the Chain-K proxy (or an observer node exposing the same API).

use crate::config::{KProxyConfig, RestApiEntityType};
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::ttl_cache::TtlCache;
use crate::types::{KAddress, KTransaction, TransactionStatus, TxFees};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const NETWORK_CONFIG_ENDPOINT: &str = "/network/config";
pub const NODE_OVERVIEW_ENDPOINT: &str = "/node/overview";
pub const SEND_TRANSACTION_ENDPOINT: &str = "/transaction/broadcast";
pub const ESTIMATE_FEE_ENDPOINT: &str = "/transaction/estimate-fee";
const PROXY_VM_QUERY_ENDPOINT: &str = "/vm/query";
const OBSERVER_VM_QUERY_ENDPOINT: &str = "/sc/query";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(rename = "chainID")]
    pub chain_id: String,
    #[serde(default)]
    pub min_gas_price: u64,
    #[serde(default)]
    pub min_gas_limit: u64,
    #[serde(default)]
    pub gas_per_data_byte: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOverview {
    pub nonce: u64,
    #[serde(default)]
    pub highest_final_nonce: u64,
}

impl NodeOverview {
    pub fn nonces_delta(&self) -> u64 {
        self.nonce.saturating_sub(self.highest_final_nonce)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub address: String,
    pub nonce: u64,
    #[serde(default)]
    pub balance: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmQuery {
    #[serde(rename = "scAddress")]
    pub sc_address: String,
    #[serde(rename = "funcName")]
    pub function: String,
    // Hex encoded
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
}

impl VmQuery {
    pub fn new(sc_address: &KAddress, function: &str) -> Self {
        Self {
            sc_address: sc_address.to_bech32(),
            function: function.to_string(),
            args: vec![],
            caller: None,
        }
    }

    pub fn arg(mut self, bytes: &[u8]) -> Self {
        self.args.push(hex::encode(bytes));
        self
    }

    pub fn arg_u64(self, value: u64) -> Self {
        if value == 0 {
            return self.arg(&[]);
        }
        let bytes = value.to_be_bytes();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        self.arg(&bytes[first..])
    }
}

/// Read and write access to a Chain-K node.
#[async_trait]
pub trait KProxy: Send + Sync {
    async fn get_network_config(&self) -> BridgeResult<NetworkConfig>;
    async fn get_node_overview(&self) -> BridgeResult<NodeOverview>;
    async fn get_account(&self, address: &KAddress) -> BridgeResult<Account>;
    async fn get_kda_balance(&self, address: &KAddress, token: &str) -> BridgeResult<u128>;
    async fn execute_vm_query(&self, query: &VmQuery) -> BridgeResult<Vec<Vec<u8>>>;
    async fn estimate_transaction_fees(&self, tx: &KTransaction) -> BridgeResult<TxFees>;
    async fn send_transaction(&self, tx: &KTransaction) -> BridgeResult<String>;
    async fn send_transactions(&self, txs: &[KTransaction]) -> BridgeResult<Vec<String>>;
    async fn get_transaction_status(&self, hash: &str) -> BridgeResult<TransactionStatus>;
    /// Like `get_transaction_status`, but turns a failed execution into `ExecutionFailed`.
    async fn process_transaction_status(&self, hash: &str) -> BridgeResult<TransactionStatus>;
}

#[derive(Debug, Deserialize)]
struct ProxyResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: String,
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmQueryData {
    #[serde(default)]
    return_data: Vec<String>,
    #[serde(default)]
    return_code: String,
    #[serde(default)]
    return_message: String,
}

pub struct KProxyClient {
    http_client: reqwest::Client,
    base_url: String,
    config: KProxyConfig,
    network_config: TtlCache<NetworkConfig>,
    metrics: Arc<BridgeMetrics>,
}

impl KProxyClient {
    pub fn new(
        base_url: &str,
        config: KProxyConfig,
        request_timeout: Duration,
        metrics: Arc<BridgeMetrics>,
    ) -> BridgeResult<Self> {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(16)
            .connect_timeout(Duration::from_secs(2))
            .timeout(request_timeout)
            .build()
            .map_err(|e| BridgeError::Generic(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            network_config: TtlCache::with_secs(config.cacher_expiration_s),
            config,
            metrics,
        })
    }

    fn vm_query_endpoint(&self) -> &'static str {
        match self.config.rest_api_entity_type {
            RestApiEntityType::Proxy => PROXY_VM_QUERY_ENDPOINT,
            RestApiEntityType::Observer => OBSERVER_VM_QUERY_ENDPOINT,
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        metric_label: &str,
        path: &str,
        body: Option<Value>,
    ) -> BridgeResult<T> {
        self.metrics
            .k_proxy_queries
            .with_label_values(&[metric_label])
            .inc();
        let timer = Instant::now();
        let result = self.request_inner(path, body).await;
        self.metrics
            .k_proxy_latency
            .with_label_values(&[metric_label])
            .observe(timer.elapsed().as_secs_f64());
        if let Err(e) = &result {
            if !matches!(e, BridgeError::TxNotFound) {
                self.metrics
                    .k_proxy_errors
                    .with_label_values(&[metric_label])
                    .inc();
            }
        }
        result
    }

    async fn request_inner<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<Value>,
    ) -> BridgeResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let request = match &body {
            Some(body) => self.http_client.post(&url).json(body),
            None => self.http_client.get(&url),
        };
        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("{}: {}", url, e)))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(BridgeError::TransientRpc(format!("{}: http {}", url, status)));
        }
        let text = response
            .text()
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("{}: {}", url, e)))?;
        let parsed: ProxyResponse = serde_json::from_str(&text).map_err(|e| {
            BridgeError::Decode(format!("{}: unexpected response {}: {}", url, status, e))
        })?;

        if status == reqwest::StatusCode::NOT_FOUND || is_not_found(&parsed.error) {
            return Err(BridgeError::TxNotFound);
        }
        if !parsed.error.is_empty() {
            return Err(BridgeError::TransientRpc(format!(
                "{}: {} (code {})",
                url, parsed.error, parsed.code
            )));
        }
        let data = parsed
            .data
            .ok_or_else(|| BridgeError::Decode(format!("{}: response without data", url)))?;
        serde_json::from_value(data)
            .map_err(|e| BridgeError::Decode(format!("{}: {}", url, e)))
    }

    async fn check_finality(&self) -> BridgeResult<()> {
        if !self.config.finality_check {
            return Ok(());
        }
        let overview = self.get_node_overview().await?;
        let delta = overview.nonces_delta();
        if delta > self.config.max_nonces_delta {
            warn!(
                "[KProxy] Node is {} blocks behind finality (max {})",
                delta, self.config.max_nonces_delta
            );
            return Err(BridgeError::TransientRpc(format!(
                "node nonce {} is {} ahead of the final nonce, allowed {}",
                overview.nonce, delta, self.config.max_nonces_delta
            )));
        }
        Ok(())
    }
}

fn is_not_found(error: &str) -> bool {
    let error = error.to_lowercase();
    error.contains("not found") || error.contains("transaction not found")
}

fn field<T: DeserializeOwned>(value: &Value, name: &str) -> BridgeResult<T> {
    let inner = value
        .get(name)
        .cloned()
        .ok_or_else(|| BridgeError::Decode(format!("missing field {}", name)))?;
    serde_json::from_value(inner).map_err(|e| BridgeError::Decode(format!("{}: {}", name, e)))
}

fn parse_status(status: &str) -> TransactionStatus {
    match status {
        "success" | "executed" => TransactionStatus::Success,
        "fail" | "failed" | "invalid" => TransactionStatus::Failed,
        _ => TransactionStatus::Pending,
    }
}

#[async_trait]
impl KProxy for KProxyClient {
    async fn get_network_config(&self) -> BridgeResult<NetworkConfig> {
        self.network_config
            .get_or_fetch(|| async {
                let data: Value = self
                    .request("network_config", NETWORK_CONFIG_ENDPOINT, None)
                    .await?;
                field::<NetworkConfig>(&data, "config")
            })
            .await
    }

    async fn get_node_overview(&self) -> BridgeResult<NodeOverview> {
        let data: Value = self
            .request("node_overview", NODE_OVERVIEW_ENDPOINT, None)
            .await?;
        field(&data, "overview")
    }

    async fn get_account(&self, address: &KAddress) -> BridgeResult<Account> {
        let path = format!("/address/{}", address.to_bech32());
        let data: Value = self.request("account", &path, None).await?;
        field(&data, "account")
    }

    async fn get_kda_balance(&self, address: &KAddress, token: &str) -> BridgeResult<u128> {
        let path = format!("/address/{}/kda/{}", address.to_bech32(), token);
        let data: Value = self.request("kda_balance", &path, None).await?;
        let balance: Value = field(&data, "balance")?;
        match balance {
            Value::Number(n) => n
                .as_u64()
                .map(u128::from)
                .ok_or_else(|| BridgeError::Decode(format!("invalid balance {}", n))),
            Value::String(s) => s
                .parse::<u128>()
                .map_err(|e| BridgeError::Decode(format!("invalid balance {}: {}", s, e))),
            other => Err(BridgeError::Decode(format!("invalid balance {}", other))),
        }
    }

    async fn execute_vm_query(&self, query: &VmQuery) -> BridgeResult<Vec<Vec<u8>>> {
        self.check_finality().await?;
        let body = serde_json::to_value(query).map_err(|e| BridgeError::Generic(e.to_string()))?;
        let data: Value = self
            .request("vm_query", self.vm_query_endpoint(), Some(body))
            .await?;
        let result: VmQueryData = field(&data, "data")?;
        if !result.return_code.is_empty() && result.return_code != "ok" {
            return Err(BridgeError::ExecutionFailed(format!(
                "vm query {} returned {}: {}",
                query.function, result.return_code, result.return_message
            )));
        }
        result
            .return_data
            .iter()
            .map(|item| {
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, item)
                    .map_err(|e| BridgeError::Decode(format!("{}: {}", query.function, e)))
            })
            .collect()
    }

    async fn estimate_transaction_fees(&self, tx: &KTransaction) -> BridgeResult<TxFees> {
        let body = serde_json::to_value(tx).map_err(|e| BridgeError::Generic(e.to_string()))?;
        let data: Value = self
            .request("estimate_fee", ESTIMATE_FEE_ENDPOINT, Some(body))
            .await?;
        Ok(TxFees {
            kapp_fee: field(&data, "kappFee")?,
            bandwidth_fee: field(&data, "bandwidthFee")?,
        })
    }

    async fn send_transaction(&self, tx: &KTransaction) -> BridgeResult<String> {
        let body = serde_json::to_value(tx).map_err(|e| BridgeError::Generic(e.to_string()))?;
        let data: Value = self
            .request("send_transaction", SEND_TRANSACTION_ENDPOINT, Some(body))
            .await?;
        let hash: String = field(&data, "txHash")?;
        debug!("[KProxy] Sent tx {} with nonce {}", hash, tx.nonce);
        Ok(hash)
    }

    async fn send_transactions(&self, txs: &[KTransaction]) -> BridgeResult<Vec<String>> {
        let mut hashes = Vec::with_capacity(txs.len());
        for tx in txs {
            hashes.push(self.send_transaction(tx).await?);
        }
        Ok(hashes)
    }

    async fn get_transaction_status(&self, hash: &str) -> BridgeResult<TransactionStatus> {
        let path = format!("/transaction/{}/status", hash);
        let data: Value = self.request("transaction_status", &path, None).await?;
        let status: String = field(&data, "status")?;
        Ok(parse_status(&status))
    }

    async fn process_transaction_status(&self, hash: &str) -> BridgeResult<TransactionStatus> {
        match self.get_transaction_status(hash).await? {
            TransactionStatus::Failed => Err(BridgeError::ExecutionFailed(format!(
                "transaction {} failed",
                hash
            ))),
            status => Ok(status),
        }
    }
}
