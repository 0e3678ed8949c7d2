// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Chain-K side of the bridge: safe and multisig contracts reached through the proxy.

use crate::balance_validator::{TokenBalanceSource, TokenSideInfo};
use crate::config::KGasMapConfig;
use crate::crypto::KTxSigner;
use crate::encoding::{be_bytes_to_bool, be_bytes_to_u256, be_bytes_to_u64, KCallBuilder};
use crate::error::{BridgeError, BridgeResult};
use crate::k_proxy::{KProxy, VmQuery};
use crate::metrics::BridgeMetrics;
use crate::nonce_handler::NonceTransactionHandler;
use crate::relay::{BridgeChainClient, TokenPairSource};
use crate::types::{
    Action, ActionKind, Batch, ChainKind, Deposit, DepositStatus, Direction, KAddress,
    KTransaction, TransactionStatus,
};
use async_trait::async_trait;
use ethers::types::{Address as EthAddress, U256};
use std::sync::{Arc, Mutex};
use tap::TapFallible;
use tracing::{debug, info, warn};

// block nonce, deposit nonce, from, to, token, amount
const FIELDS_PER_DEPOSIT: usize = 6;

pub struct KBridgeClient {
    proxy: Arc<dyn KProxy>,
    nonce_handler: Arc<NonceTransactionHandler>,
    signer: Arc<KTxSigner>,
    safe: KAddress,
    multisig: KAddress,
    gas_map: KGasMapConfig,
    // Used when the proxy reports no chain id
    chain_id: String,
    availability_allow_delta: u64,
    // (latest node nonce, consecutive checks without progress)
    availability: Mutex<(u64, u64)>,
    metrics: Arc<BridgeMetrics>,
}

impl KBridgeClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        proxy: Arc<dyn KProxy>,
        nonce_handler: Arc<NonceTransactionHandler>,
        signer: Arc<KTxSigner>,
        safe: KAddress,
        multisig: KAddress,
        gas_map: KGasMapConfig,
        chain_id: String,
        availability_allow_delta: u64,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            proxy,
            nonce_handler,
            signer,
            safe,
            multisig,
            gas_map,
            chain_id,
            availability_allow_delta,
            availability: Mutex::new((0, 0)),
            metrics,
        }
    }

    pub fn relayer_address(&self) -> &KAddress {
        self.signer.address()
    }

    async fn query(&self, query: VmQuery) -> BridgeResult<Vec<Vec<u8>>> {
        let function = query.function.clone();
        self.proxy
            .execute_vm_query(&query)
            .await
            .tap_err(|e| debug!("[KProxy] VM query {} failed: {}", function, e))
    }

    async fn query_u64(&self, query: VmQuery) -> BridgeResult<u64> {
        let data = self.query(query).await?;
        be_bytes_to_u64(first(&data))
    }

    async fn query_bool(&self, query: VmQuery) -> BridgeResult<bool> {
        let data = self.query(query).await?;
        Ok(be_bytes_to_bool(first(&data)))
    }

    async fn query_u256(&self, query: VmQuery) -> BridgeResult<U256> {
        let data = self.query(query).await?;
        be_bytes_to_u256(first(&data))
    }

    async fn send_to_multisig(&self, call: KCallBuilder, gas_limit: u64) -> BridgeResult<String> {
        let function = call.function().to_string();
        let network = self.proxy.get_network_config().await?;
        let mut tx = KTransaction::new(self.signer.address(), &self.multisig, call.build(), gas_limit);
        tx.chain_id = if network.chain_id.is_empty() {
            self.chain_id.clone()
        } else {
            network.chain_id
        };
        tx.gas_price = network.min_gas_price;

        self.nonce_handler.apply_nonce_and_gas_price(&mut tx).await?;
        self.signer.sign_transaction(&mut tx)?;
        let hash = self.nonce_handler.send_transaction(&tx).await?;
        self.metrics
            .txs_sent
            .with_label_values(&[&ChainKind::K.to_string(), &function])
            .inc();
        info!(
            "[KProxy] Sent {} with nonce {} and gas limit {}: {}",
            function, tx.nonce, gas_limit, hash
        );
        Ok(hash)
    }

    async fn fetch_batch(&self, query: VmQuery) -> BridgeResult<Option<Batch>> {
        let data = self.query(query).await?;
        decode_batch(&data)
    }

    /// Ed25519 keys of the relayers currently staked in the multisig.
    pub async fn get_all_staked_relayers(&self) -> BridgeResult<Vec<Vec<u8>>> {
        let data = self
            .query(VmQuery::new(&self.multisig, "getAllStakedRelayers"))
            .await?;
        Ok(data.into_iter().filter(|key| key.len() == 32).collect())
    }

    /// The node is unavailable once its nonce stalls for more than the allowed number
    /// of consecutive checks. Updates the availability gauge.
    pub async fn check_availability(&self) -> bool {
        let available = match self.proxy.get_node_overview().await {
            Ok(overview) => {
                let mut state = self.availability.lock().unwrap_or_else(|e| e.into_inner());
                if overview.nonce > state.0 {
                    *state = (overview.nonce, 0);
                } else {
                    state.1 += 1;
                }
                if state.1 > self.availability_allow_delta {
                    warn!(
                        "[KProxy] Node nonce stuck at {} for {} checks",
                        state.0, state.1
                    );
                }
                state.1 <= self.availability_allow_delta
            }
            Err(e) => {
                warn!("[KProxy] Availability check failed: {}", e);
                false
            }
        };
        self.metrics.k_client_available.set(available as i64);
        available
    }

    fn perform_action_gas(&self, batch: &Batch) -> u64 {
        let deposits = batch.deposits.len() as u64;
        let mut gas = self.gas_map.perform_action_base + self.gas_map.perform_action_for_each * deposits;
        for deposit in batch.deposits.iter().filter(|d| !d.call_data.is_empty()) {
            gas += self.gas_map.sc_call_perform_for_each
                + self.gas_map.sc_call_per_byte * deposit.call_data.len() as u64;
        }
        gas
    }
}

fn first(data: &[Vec<u8>]) -> &[u8] {
    data.first().map(Vec::as_slice).unwrap_or_default()
}

/// Appends the transfers of `batch` the way the multisig hashes them for proposals.
fn transfer_call(call: KCallBuilder, batch: &Batch) -> KCallBuilder {
    let mut call = call.arg_u64(batch.batch_id);
    for deposit in &batch.deposits {
        call = call
            .arg_bytes(&deposit.from)
            .arg_bytes(&deposit.to)
            .arg_bytes(&deposit.destination_token)
            .arg_biguint(deposit.transfer_amount())
            .arg_u64(deposit.deposit_nonce)
            .arg_bytes(&deposit.call_data);
    }
    call
}

fn transfer_query(query: VmQuery, batch: &Batch) -> VmQuery {
    let call = transfer_call(KCallBuilder::default(), batch);
    let mut query = query;
    query.args.extend(call.hex_args().iter().cloned());
    query
}

fn status_query(query: VmQuery, batch_id: u64, statuses: &[DepositStatus]) -> VmQuery {
    statuses
        .iter()
        .fold(query.arg_u64(batch_id), |q, s| q.arg(&[u8::from(*s)]))
}

/// Decodes `[batch id, (block nonce, deposit nonce, from, to, token, amount)*]`.
pub(crate) fn decode_batch(data: &[Vec<u8>]) -> BridgeResult<Option<Batch>> {
    let Some((id, rest)) = data.split_first() else {
        return Ok(None);
    };
    let batch_id = be_bytes_to_u64(id)?;
    if batch_id == 0 {
        return Ok(None);
    }
    if rest.len() % FIELDS_PER_DEPOSIT != 0 {
        return Err(BridgeError::Decode(format!(
            "batch {} has {} fields, not a multiple of {}",
            batch_id,
            rest.len(),
            FIELDS_PER_DEPOSIT
        )));
    }
    let deposits = rest
        .chunks(FIELDS_PER_DEPOSIT)
        .map(|fields| {
            let from = KAddress::from_slice(&fields[2])?;
            let to = &fields[3];
            if to.len() != EthAddress::len_bytes() {
                return Err(BridgeError::InvalidAddress(format!(
                    "recipient of {} bytes",
                    to.len()
                )));
            }
            Ok(Deposit {
                deposit_nonce: be_bytes_to_u64(&fields[1])?,
                from: fields[2].clone(),
                to: to.clone(),
                source_token: fields[4].clone(),
                destination_token: vec![],
                amount: be_bytes_to_u256(&fields[5])?,
                fee: U256::zero(),
                call_data: vec![],
                display_from: from.to_bech32(),
                display_to: format!("0x{}", hex::encode(to)),
                display_token: String::from_utf8_lossy(&fields[4]).to_string(),
            })
        })
        .collect::<BridgeResult<Vec<_>>>()?;
    Ok(Some(Batch { batch_id, deposits }))
}

#[async_trait]
impl BridgeChainClient for KBridgeClient {
    fn chain(&self) -> ChainKind {
        ChainKind::K
    }

    async fn get_pending_batch(&self) -> BridgeResult<Option<Batch>> {
        self.fetch_batch(VmQuery::new(&self.safe, "getCurrentTxBatch"))
            .await
    }

    async fn get_batch(&self, batch_id: u64) -> BridgeResult<Option<Batch>> {
        self.fetch_batch(VmQuery::new(&self.safe, "getBatch").arg_u64(batch_id))
            .await
    }

    async fn get_last_executed_batch_id(&self) -> BridgeResult<u64> {
        self.query_u64(VmQuery::new(&self.multisig, "getLastExecutedEthBatchId"))
            .await
    }

    async fn was_proposed_transfer(&self, batch: &Batch) -> BridgeResult<bool> {
        self.query_bool(transfer_query(
            VmQuery::new(&self.multisig, "wasTransferActionProposed"),
            batch,
        ))
        .await
    }

    async fn was_proposed_set_status(
        &self,
        batch_id: u64,
        statuses: &[DepositStatus],
    ) -> BridgeResult<bool> {
        self.query_bool(status_query(
            VmQuery::new(
                &self.multisig,
                "wasSetCurrentTransactionBatchStatusActionProposed",
            ),
            batch_id,
            statuses,
        ))
        .await
    }

    async fn get_action_id_for(
        &self,
        kind: ActionKind,
        batch: &Batch,
        statuses: &[DepositStatus],
    ) -> BridgeResult<u64> {
        let query = match kind {
            ActionKind::Transfer => transfer_query(
                VmQuery::new(&self.multisig, "getActionIdForTransferBatch"),
                batch,
            ),
            ActionKind::SetStatus => status_query(
                VmQuery::new(
                    &self.multisig,
                    "getActionIdForSetCurrentTransactionBatchStatus",
                ),
                batch.batch_id,
                statuses,
            ),
        };
        self.query_u64(query).await
    }

    async fn was_executed(&self, action: &Action) -> BridgeResult<bool> {
        if action.action_id == 0 {
            return Ok(false);
        }
        self.query_bool(VmQuery::new(&self.multisig, "wasActionExecuted").arg_u64(action.action_id))
            .await
    }

    async fn quorum_reached(&self, action_id: u64) -> BridgeResult<bool> {
        self.query_bool(VmQuery::new(&self.multisig, "quorumReached").arg_u64(action_id))
            .await
    }

    async fn was_signed(&self, action_id: u64) -> BridgeResult<bool> {
        self.query_bool(
            VmQuery::new(&self.multisig, "signed")
                .arg(self.signer.address().as_bytes())
                .arg_u64(action_id),
        )
        .await
    }

    async fn get_quorum(&self) -> BridgeResult<usize> {
        let quorum = self
            .query_u64(VmQuery::new(&self.multisig, "getQuorum"))
            .await?;
        Ok(quorum as usize)
    }

    async fn get_statuses_after_execution(
        &self,
        batch_id: u64,
    ) -> BridgeResult<Option<Vec<DepositStatus>>> {
        let data = self
            .query(VmQuery::new(&self.multisig, "getStatusesAfterExecution").arg_u64(batch_id))
            .await?;
        let Some((is_final, statuses)) = data.split_first() else {
            return Ok(None);
        };
        if !be_bytes_to_bool(is_final) {
            return Ok(None);
        }
        statuses
            .iter()
            .map(|s| {
                let value = be_bytes_to_u64(s)? as u8;
                DepositStatus::try_from(value)
                    .map_err(|_| BridgeError::Decode(format!("unknown deposit status {}", value)))
            })
            .collect::<BridgeResult<Vec<_>>>()
            .map(Some)
    }

    async fn propose_transfer(&self, batch: &Batch) -> BridgeResult<String> {
        let gas = self.gas_map.propose_transfer_base
            + self.gas_map.propose_transfer_for_each * batch.deposits.len() as u64;
        let call = transfer_call(KCallBuilder::new("proposeMultiTransferEsdtBatch"), batch);
        self.send_to_multisig(call, gas).await
    }

    async fn propose_set_status(
        &self,
        batch_id: u64,
        statuses: &[DepositStatus],
    ) -> BridgeResult<String> {
        let gas = self.gas_map.propose_status_base
            + self.gas_map.propose_status_for_each * statuses.len() as u64;
        let call = statuses.iter().fold(
            KCallBuilder::new("proposeEsdtSafeSetCurrentTransactionBatchStatus").arg_u64(batch_id),
            |call, s| call.arg_bytes(&[u8::from(*s)]),
        );
        self.send_to_multisig(call, gas).await
    }

    async fn sign(&self, action_id: u64) -> BridgeResult<String> {
        self.send_to_multisig(KCallBuilder::new("sign").arg_u64(action_id), self.gas_map.sign)
            .await
    }

    // Chain-K verifies the on-chain signatures itself; only the action id is sent
    async fn perform_action(
        &self,
        action: &Action,
        batch: &Batch,
        _signatures: &[Vec<u8>],
    ) -> BridgeResult<String> {
        self.send_to_multisig(
            KCallBuilder::new("performAction").arg_u64(action.action_id),
            self.perform_action_gas(batch),
        )
        .await
    }

    async fn get_transaction_status(&self, hash: &str) -> BridgeResult<TransactionStatus> {
        self.proxy.get_transaction_status(hash).await
    }

    async fn get_current_nonce(&self) -> BridgeResult<u64> {
        Ok(self.proxy.get_account(self.signer.address()).await?.nonce)
    }

    async fn is_paused(&self) -> BridgeResult<bool> {
        self.query_bool(VmQuery::new(&self.multisig, "isPaused")).await
    }
}

#[async_trait]
impl TokenPairSource for KBridgeClient {
    async fn counterpart_token(
        &self,
        direction: Direction,
        source_token: &[u8],
    ) -> BridgeResult<Option<Vec<u8>>> {
        let function = match direction {
            Direction::EthToK => "getTokenIdForErc20Address",
            Direction::KToEth => "getErc20AddressForTokenId",
        };
        let data = self
            .query(VmQuery::new(&self.multisig, function).arg(source_token))
            .await?;
        Ok(data.into_iter().next().filter(|token| !token.is_empty()))
    }
}

#[async_trait]
impl TokenBalanceSource for KBridgeClient {
    fn chain(&self) -> ChainKind {
        ChainKind::K
    }

    async fn token_side_info(&self, token: &[u8]) -> BridgeResult<TokenSideInfo> {
        let query = |function: &str| VmQuery::new(&self.safe, function).arg(token);
        let (is_native, is_mint_burn, total, mint, burn) = futures::try_join!(
            self.query_bool(query("isNativeToken")),
            self.query_bool(query("isMintBurnToken")),
            self.query_u256(query("getTotalBalances")),
            self.query_u256(query("getMintBalances")),
            self.query_u256(query("getBurnBalances")),
        )?;
        Ok(TokenSideInfo {
            is_native,
            is_mint_burn,
            total,
            mint,
            burn,
        })
    }
}
