// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Chain-E side of the bridge: the ERC20 safe and the multisig bridge contract.

use crate::balance_validator::{TokenBalanceSource, TokenSideInfo};
use crate::config::EthConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::metered_eth_provider::{new_metered_eth_provider, MeteredEthHttpProvider};
use crate::metrics::BridgeMetrics;
use crate::relay::BridgeChainClient;
use crate::types::{
    Action, ActionKind, Batch, ChainKind, Deposit, DepositStatus, KAddress, TransactionStatus,
};
use async_trait::async_trait;
use ethers::abi::{parse_abi, Token, Tokenize};
use ethers::contract::BaseContract;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as EthAddress, Bytes, TransactionRequest, H256, U256};
use std::str::FromStr;
use std::sync::Arc;
use tap::TapFallible;
use tracing::{debug, info};

const SAFE_ABI: &[&str] = &[
    "function getBatch(uint256 batchNonce) external view returns ((uint112,uint64,uint64,uint16) batch, bool isBatchFinal)",
    "function getDeposits(uint256 batchNonce) external view returns ((uint112,address,uint256,address,bytes32,uint8)[] deposits, bool areDepositsFinal)",
    "function nativeTokens(address token) external view returns (bool)",
    "function mintBurnTokens(address token) external view returns (bool)",
    "function totalBalances(address token) external view returns (uint256)",
    "function mintBalances(address token) external view returns (uint256)",
    "function burnBalances(address token) external view returns (uint256)",
];

const BRIDGE_ABI: &[&str] = &[
    "function wasBatchExecuted(uint256 batchNonce) external view returns (bool)",
    "function quorum() external view returns (uint256)",
    "function paused() external view returns (bool)",
    "function getRelayers() external view returns (address[])",
    "function getStatusesAfterExecution(uint256 batchNonce) external view returns (uint8[] statuses, bool isFinal)",
    "function executeTransfer(address[] tokens, address[] recipients, uint256[] amounts, uint256[] depositNonces, uint256 batchNonce, bytes[] signatures) external",
];

struct Contract {
    address: EthAddress,
    abi: BaseContract,
}

impl Contract {
    fn new(address: EthAddress, abi: &[&str]) -> BridgeResult<Self> {
        let abi = parse_abi(abi).map_err(|e| BridgeError::Generic(format!("bad abi: {}", e)))?;
        Ok(Self {
            address,
            abi: BaseContract::from(abi),
        })
    }
}

/// Gas price to bid: the node's price times the multiplier, never above the cap.
pub fn bid_gas_price(node_price: U256, multiplier: u64, max_gas_price: u64) -> U256 {
    let price = node_price.saturating_mul(U256::from(multiplier.max(1)));
    if max_gas_price == 0 {
        return price;
    }
    price.min(U256::from(max_gas_price))
}

pub struct EthBridgeClient<P> {
    provider: Provider<P>,
    wallet: LocalWallet,
    safe: Contract,
    bridge: Contract,
    gas_limit_base: u64,
    gas_limit_for_each: u64,
    gas_price_multiplier: u64,
    max_gas_price: u64,
    metrics: Arc<BridgeMetrics>,
}

impl EthBridgeClient<MeteredEthHttpProvider> {
    pub async fn new(
        config: &EthConfig,
        wallet: LocalWallet,
        safe: EthAddress,
        bridge: EthAddress,
        metrics: Arc<BridgeMetrics>,
    ) -> anyhow::Result<Self> {
        let provider = new_metered_eth_provider(&config.network_address, metrics.clone())?;
        let client = Self::new_with_provider(provider, wallet, safe, bridge, config, metrics)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        client.describe(config.chain_id).await?;
        Ok(client)
    }
}

impl<P> EthBridgeClient<P>
where
    P: JsonRpcClient + Clone + 'static,
{
    pub fn new_with_provider(
        provider: Provider<P>,
        wallet: LocalWallet,
        safe: EthAddress,
        bridge: EthAddress,
        config: &EthConfig,
        metrics: Arc<BridgeMetrics>,
    ) -> BridgeResult<Self> {
        Ok(Self {
            provider,
            wallet: wallet.with_chain_id(config.chain_id),
            safe: Contract::new(safe, SAFE_ABI)?,
            bridge: Contract::new(bridge, BRIDGE_ABI)?,
            gas_limit_base: config.gas_limit_base,
            gas_limit_for_each: config.gas_limit_for_each,
            gas_price_multiplier: config.gas_station.gas_price_multiplier,
            max_gas_price: config.gas_station.max_gas_price,
            metrics,
        })
    }

    pub fn relayer_address(&self) -> EthAddress {
        self.wallet.address()
    }

    /// Addresses allowed to sign `executeTransfer`.
    pub async fn get_relayers(&self) -> BridgeResult<Vec<EthAddress>> {
        let tokens = self.call(&self.bridge, "getRelayers", ()).await?;
        first_token(tokens, "getRelayers")?
            .into_array()
            .ok_or_else(|| BridgeError::Decode("getRelayers did not return an array".to_string()))?
            .into_iter()
            .map(|token| {
                token
                    .into_address()
                    .ok_or_else(|| BridgeError::Decode("getRelayers returned a non address".to_string()))
            })
            .collect()
    }

    // Refuses to run against a node of another chain
    async fn describe(&self, expected_chain_id: u64) -> anyhow::Result<()> {
        let chain_id = self.provider.get_chainid().await?.as_u64();
        let block_number = self.provider.get_block_number().await?;
        if chain_id != expected_chain_id {
            return Err(anyhow::anyhow!(
                "Chain ID mismatch: expected {}, got {}",
                expected_chain_id,
                chain_id
            ));
        }
        info!(
            "EthBridgeClient connected to chain {}, current block: {}",
            chain_id, block_number
        );
        Ok(())
    }

    async fn call(
        &self,
        contract: &Contract,
        function: &str,
        args: impl Tokenize,
    ) -> BridgeResult<Vec<Token>> {
        let data = contract
            .abi
            .encode(function, args)
            .map_err(|e| BridgeError::Generic(format!("encode {}: {}", function, e)))?;
        let tx: TypedTransaction = TransactionRequest::new()
            .to(contract.address)
            .data(data)
            .into();
        let output = self
            .provider
            .call(&tx, None)
            .await
            .tap_err(|e| debug!("eth_call {} failed: {:?}", function, e))
            .map_err(|e| BridgeError::TransientRpc(format!("{}: {}", function, e)))?;
        contract
            .abi
            .abi()
            .function(function)
            .and_then(|f| f.decode_output(&output))
            .map_err(|e| BridgeError::Decode(format!("{}: {}", function, e)))
    }

    async fn call_bool(&self, contract: &Contract, function: &str, args: impl Tokenize) -> BridgeResult<bool> {
        let tokens = self.call(contract, function, args).await?;
        first_token(tokens, function)?
            .into_bool()
            .ok_or_else(|| BridgeError::Decode(format!("{} did not return a bool", function)))
    }

    async fn call_uint(&self, contract: &Contract, function: &str, args: impl Tokenize) -> BridgeResult<U256> {
        let tokens = self.call(contract, function, args).await?;
        first_token(tokens, function)?
            .into_uint()
            .ok_or_else(|| BridgeError::Decode(format!("{} did not return a uint", function)))
    }

    async fn send(&self, function: &str, data: Bytes, gas_limit: u64) -> BridgeResult<String> {
        let node_price = self
            .provider
            .get_gas_price()
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("eth_gasPrice: {}", e)))?;
        let gas_price = bid_gas_price(node_price, self.gas_price_multiplier, self.max_gas_price);
        let tx = TransactionRequest::new()
            .to(self.bridge.address)
            .data(data)
            .gas(gas_limit)
            .gas_price(gas_price);

        let signer = SignerMiddleware::new(self.provider.clone(), self.wallet.clone());
        let pending = signer
            .send_transaction(tx, None)
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("{}: {}", function, e)))?;
        let hash = format!("{:?}", pending.tx_hash());
        self.metrics
            .txs_sent
            .with_label_values(&[&ChainKind::Eth.to_string(), function])
            .inc();
        info!(
            "Sent {} with gas limit {} and gas price {}: {}",
            function, gas_limit, gas_price, hash
        );
        Ok(hash)
    }
}

fn first_token(tokens: Vec<Token>, function: &str) -> BridgeResult<Token> {
    tokens
        .into_iter()
        .next()
        .ok_or_else(|| BridgeError::Decode(format!("{} returned nothing", function)))
}

fn unsupported(operation: &str) -> BridgeError {
    BridgeError::Generic(format!("{} is not supported on Chain-E", operation))
}

fn decode_deposit(token: Token) -> BridgeResult<Deposit> {
    let bad = || BridgeError::Decode("malformed deposit tuple".to_string());
    let fields = token.into_tuple().ok_or_else(bad)?;
    let [nonce, token_address, amount, depositor, recipient, _status]: [Token; 6] =
        fields.try_into().map_err(|_| bad())?;
    let nonce = nonce.into_uint().ok_or_else(bad)?;
    let token_address = token_address.into_address().ok_or_else(bad)?;
    let depositor = depositor.into_address().ok_or_else(bad)?;
    let recipient = recipient.into_fixed_bytes().ok_or_else(bad)?;
    let display_to = KAddress::from_slice(&recipient)
        .map(|a| a.to_bech32())
        .unwrap_or_else(|_| hex::encode(&recipient));
    Ok(Deposit {
        deposit_nonce: nonce.low_u64(),
        from: depositor.as_bytes().to_vec(),
        to: recipient,
        source_token: token_address.as_bytes().to_vec(),
        destination_token: vec![],
        amount: amount.into_uint().ok_or_else(bad)?,
        fee: U256::zero(),
        call_data: vec![],
        display_from: format!("{:?}", depositor),
        display_to,
        display_token: format!("{:?}", token_address),
    })
}

fn eth_address(bytes: &[u8]) -> BridgeResult<EthAddress> {
    if bytes.len() != EthAddress::len_bytes() {
        return Err(BridgeError::InvalidAddress(format!(
            "expected a 20 byte address, got {} bytes",
            bytes.len()
        )));
    }
    Ok(EthAddress::from_slice(bytes))
}

#[async_trait]
impl<P> BridgeChainClient for EthBridgeClient<P>
where
    P: JsonRpcClient + Clone + 'static,
{
    fn chain(&self) -> ChainKind {
        ChainKind::Eth
    }

    // E -> K batches are addressed by id only
    async fn get_pending_batch(&self) -> BridgeResult<Option<Batch>> {
        Err(unsupported("get_pending_batch"))
    }

    async fn get_batch(&self, batch_id: u64) -> BridgeResult<Option<Batch>> {
        let tokens = self
            .call(&self.safe, "getBatch", (U256::from(batch_id),))
            .await?;
        let is_final = tokens.get(1).cloned().and_then(Token::into_bool).unwrap_or(false);
        if !is_final {
            debug!("Batch {} is not final on Chain-E", batch_id);
            return Ok(None);
        }

        let mut tokens = self
            .call(&self.safe, "getDeposits", (U256::from(batch_id),))
            .await?
            .into_iter();
        let deposits = tokens
            .next()
            .and_then(Token::into_array)
            .ok_or_else(|| BridgeError::Decode("getDeposits returned no array".to_string()))?;
        let deposits_final = tokens.next().and_then(Token::into_bool).unwrap_or(false);
        if !deposits_final {
            return Ok(None);
        }
        let deposits = deposits
            .into_iter()
            .map(decode_deposit)
            .collect::<BridgeResult<Vec<_>>>()?;
        Ok(Some(Batch { batch_id, deposits }))
    }

    async fn get_last_executed_batch_id(&self) -> BridgeResult<u64> {
        Err(unsupported("get_last_executed_batch_id"))
    }

    // Chain-E has no proposal step
    async fn was_proposed_transfer(&self, _batch: &Batch) -> BridgeResult<bool> {
        Ok(false)
    }

    async fn was_proposed_set_status(
        &self,
        _batch_id: u64,
        _statuses: &[DepositStatus],
    ) -> BridgeResult<bool> {
        Ok(false)
    }

    async fn get_action_id_for(
        &self,
        kind: ActionKind,
        batch: &Batch,
        _statuses: &[DepositStatus],
    ) -> BridgeResult<u64> {
        match kind {
            ActionKind::Transfer => Ok(batch.batch_id),
            ActionKind::SetStatus => Err(unsupported("set status")),
        }
    }

    async fn was_executed(&self, action: &Action) -> BridgeResult<bool> {
        match action.kind {
            ActionKind::Transfer => {
                self.call_bool(&self.bridge, "wasBatchExecuted", (U256::from(action.batch_id),))
                    .await
            }
            ActionKind::SetStatus => Err(unsupported("set status")),
        }
    }

    async fn quorum_reached(&self, _action_id: u64) -> BridgeResult<bool> {
        Err(unsupported("on-chain quorum"))
    }

    async fn was_signed(&self, _action_id: u64) -> BridgeResult<bool> {
        Err(unsupported("on-chain signing"))
    }

    async fn get_quorum(&self) -> BridgeResult<usize> {
        let quorum = self.call_uint(&self.bridge, "quorum", ()).await?;
        Ok(quorum.low_u64() as usize)
    }

    async fn get_statuses_after_execution(
        &self,
        batch_id: u64,
    ) -> BridgeResult<Option<Vec<DepositStatus>>> {
        let mut tokens = self
            .call(&self.bridge, "getStatusesAfterExecution", (U256::from(batch_id),))
            .await?
            .into_iter();
        let statuses = tokens.next().and_then(Token::into_array).unwrap_or_default();
        let is_final = tokens.next().and_then(Token::into_bool).unwrap_or(false);
        if !is_final {
            return Ok(None);
        }
        statuses
            .into_iter()
            .map(|token| {
                let value = token
                    .into_uint()
                    .ok_or_else(|| BridgeError::Decode("status is not a uint".to_string()))?
                    .low_u32() as u8;
                DepositStatus::try_from(value)
                    .map_err(|_| BridgeError::Decode(format!("unknown deposit status {}", value)))
            })
            .collect::<BridgeResult<Vec<_>>>()
            .map(Some)
    }

    async fn propose_transfer(&self, _batch: &Batch) -> BridgeResult<String> {
        Err(unsupported("propose_transfer"))
    }

    async fn propose_set_status(
        &self,
        _batch_id: u64,
        _statuses: &[DepositStatus],
    ) -> BridgeResult<String> {
        Err(unsupported("propose_set_status"))
    }

    async fn sign(&self, _action_id: u64) -> BridgeResult<String> {
        Err(unsupported("on-chain signing"))
    }

    async fn perform_action(
        &self,
        action: &Action,
        batch: &Batch,
        signatures: &[Vec<u8>],
    ) -> BridgeResult<String> {
        let mut tokens = Vec::with_capacity(batch.deposits.len());
        let mut recipients = Vec::with_capacity(batch.deposits.len());
        let mut amounts = Vec::with_capacity(batch.deposits.len());
        let mut nonces = Vec::with_capacity(batch.deposits.len());
        for deposit in &batch.deposits {
            tokens.push(Token::Address(eth_address(&deposit.destination_token)?));
            recipients.push(Token::Address(eth_address(&deposit.to)?));
            amounts.push(Token::Uint(deposit.transfer_amount()));
            nonces.push(Token::Uint(U256::from(deposit.deposit_nonce)));
        }
        let signatures = signatures
            .iter()
            .map(|s| Token::Bytes(s.clone()))
            .collect();
        let data = self
            .bridge
            .abi
            .encode(
                "executeTransfer",
                (
                    Token::Array(tokens),
                    Token::Array(recipients),
                    Token::Array(amounts),
                    Token::Array(nonces),
                    Token::Uint(U256::from(action.batch_id)),
                    Token::Array(signatures),
                ),
            )
            .map_err(|e| BridgeError::Generic(format!("encode executeTransfer: {}", e)))?;
        let gas_limit = self.gas_limit_base + self.gas_limit_for_each * batch.deposits.len() as u64;
        self.send("executeTransfer", data, gas_limit).await
    }

    async fn get_transaction_status(&self, hash: &str) -> BridgeResult<TransactionStatus> {
        let tx_hash = H256::from_str(hash)
            .map_err(|e| BridgeError::Decode(format!("tx hash {}: {}", hash, e)))?;
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("receipt {}: {}", hash, e)))?;
        match receipt {
            Some(receipt) if receipt.status.map(|s| s.as_u64()) == Some(1) => {
                Ok(TransactionStatus::Success)
            }
            Some(_) => Ok(TransactionStatus::Failed),
            None => {
                let tx = self
                    .provider
                    .get_transaction(tx_hash)
                    .await
                    .map_err(|e| BridgeError::TransientRpc(format!("tx {}: {}", hash, e)))?;
                match tx {
                    Some(_) => Ok(TransactionStatus::Pending),
                    None => Err(BridgeError::TxNotFound),
                }
            }
        }
    }

    async fn get_current_nonce(&self) -> BridgeResult<u64> {
        let nonce = self
            .provider
            .get_transaction_count(self.wallet.address(), None)
            .await
            .map_err(|e| BridgeError::TransientRpc(format!("nonce: {}", e)))?;
        Ok(nonce.low_u64())
    }

    async fn is_paused(&self) -> BridgeResult<bool> {
        self.call_bool(&self.bridge, "paused", ()).await
    }
}

#[async_trait]
impl<P> TokenBalanceSource for EthBridgeClient<P>
where
    P: JsonRpcClient + Clone + 'static,
{
    fn chain(&self) -> ChainKind {
        ChainKind::Eth
    }

    async fn token_side_info(&self, token: &[u8]) -> BridgeResult<TokenSideInfo> {
        let token = eth_address(token)?;
        Ok(TokenSideInfo {
            is_native: self.call_bool(&self.safe, "nativeTokens", (token,)).await?,
            is_mint_burn: self.call_bool(&self.safe, "mintBurnTokens", (token,)).await?,
            total: self.call_uint(&self.safe, "totalBalances", (token,)).await?,
            mint: self.call_uint(&self.safe, "mintBalances", (token,)).await?,
            burn: self.call_uint(&self.safe, "burnBalances", (token,)).await?,
        })
    }
}
