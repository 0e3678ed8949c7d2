// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use super::call_data::{extract_gas_limit, parse_pending_transactions, ProxySCCompleteCallData};
use super::filter::PendingOperationFilter;
use crate::config::{ScCallsConfig, CONTRACT_MAX_GAS_LIMIT};
use crate::crypto::KTxSigner;
use crate::encoding::KCallBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::k_proxy::{KProxy, VmQuery};
use crate::metrics::BridgeMetrics;
use crate::nonce_handler::NonceTransactionHandler;
use crate::types::{ChainKind, KAddress, KTransaction, TransactionStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const GET_PENDING_TRANSACTIONS: &str = "getPendingTransactions";
const EXECUTE: &str = "execute";

/// What the executor decided for one pending operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationPlan {
    Execute { gas_limit: u64 },
    Skip { reason: &'static str },
}

/// Executes the SC calls parked in the SC proxy contract by Chain-E deposits.
pub struct ScCallExecutor {
    proxy: Arc<dyn KProxy>,
    nonce_handler: Arc<NonceTransactionHandler>,
    signer: Arc<KTxSigner>,
    filter: PendingOperationFilter,
    sc_proxy: KAddress,
    config: ScCallsConfig,
    // Used when the proxy reports no chain id
    chain_id: String,
    close_app: mpsc::Sender<()>,
    metrics: Arc<BridgeMetrics>,
}

impl ScCallExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        proxy: Arc<dyn KProxy>,
        nonce_handler: Arc<NonceTransactionHandler>,
        signer: Arc<KTxSigner>,
        filter: PendingOperationFilter,
        sc_proxy: KAddress,
        config: ScCallsConfig,
        chain_id: String,
        close_app: mpsc::Sender<()>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            proxy,
            nonce_handler,
            signer,
            filter,
            sc_proxy,
            config,
            chain_id,
            close_app,
            metrics,
        }
    }

    /// Applies the filter and both gas thresholds to one operation.
    pub fn plan(&self, call: &ProxySCCompleteCallData) -> OperationPlan {
        if !self.filter.should_execute(call) {
            return OperationPlan::Skip { reason: "filtered" };
        }
        let declared = extract_gas_limit(&call.raw_call_data).unwrap_or_else(|e| {
            debug!("[SCExecutor] No gas limit in call data of {}: {}", call, e);
            0
        });
        let mut gas_limit = declared.saturating_add(self.config.extra_gas_to_execute);
        if gas_limit > CONTRACT_MAX_GAS_LIMIT {
            // The destination contract refunds the deposit
            gas_limit = self.config.gas_limit_for_out_of_gas_transactions;
        }
        if gas_limit > self.config.max_gas_limit_to_use {
            return OperationPlan::Skip {
                reason: "gas_too_high",
            };
        }
        OperationPlan::Execute { gas_limit }
    }

    /// Runs one pass over the pending operations. The first failure aborts the pass;
    /// the remaining operations are picked up by the next one.
    pub async fn execute_cycle(&self, cancel: &CancellationToken) -> BridgeResult<usize> {
        let results = self
            .proxy
            .execute_vm_query(&VmQuery::new(&self.sc_proxy, GET_PENDING_TRANSACTIONS))
            .await?;
        let pending = parse_pending_transactions(&results)?;
        self.metrics.sc_calls_pending.set(pending.len() as i64);
        if pending.is_empty() {
            return Ok(0);
        }
        info!("[SCExecutor] {} pending operations", pending.len());

        let mut executed = 0;
        for (id, call) in pending {
            let gas_limit = match self.plan(&call) {
                OperationPlan::Execute { gas_limit } => gas_limit,
                OperationPlan::Skip { reason } => {
                    warn!("[SCExecutor] Skipping operation {} ({}): {}", id, reason, call);
                    self.metrics
                        .sc_calls_skipped
                        .with_label_values(&[reason])
                        .inc();
                    continue;
                }
            };
            if let Err(e) = self.execute_operation(id, &call, gas_limit, cancel).await {
                error!("[SCExecutor] Operation {} failed: {}", id, e);
                self.metrics.sc_calls_failed.inc();
                self.handle_error(cancel).await;
                return Err(e);
            }
            executed += 1;
        }
        Ok(executed)
    }

    async fn execute_operation(
        &self,
        id: u64,
        call: &ProxySCCompleteCallData,
        gas_limit: u64,
        cancel: &CancellationToken,
    ) -> BridgeResult<()> {
        let network = self.proxy.get_network_config().await?;
        let data = KCallBuilder::new(EXECUTE).arg_u64(id).build();
        let mut tx = KTransaction::new(self.signer.address(), &self.sc_proxy, data, gas_limit);
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
            .with_label_values(&[&ChainKind::K.to_string(), EXECUTE])
            .inc();
        info!(
            "[SCExecutor] Sent operation {} ({}) with nonce {} and gas limit {}: {}",
            id, call, tx.nonce, gas_limit, hash
        );

        if self.config.transaction_checks.check_transaction_results {
            self.wait_for_result(&hash, cancel).await?;
        }
        self.metrics.sc_calls_executed.inc();
        Ok(())
    }

    async fn wait_for_result(&self, hash: &str, cancel: &CancellationToken) -> BridgeResult<()> {
        let checks = &self.config.transaction_checks;
        let deadline = Instant::now() + checks.execution_timeout();
        loop {
            match self.proxy.process_transaction_status(hash).await {
                Ok(TransactionStatus::Success) => {
                    debug!("[SCExecutor] Transaction {} executed", hash);
                    return Ok(());
                }
                Ok(TransactionStatus::Failed) => {
                    return Err(BridgeError::ExecutionFailed(format!("transaction {}", hash)))
                }
                Ok(TransactionStatus::Pending) | Err(BridgeError::TxNotFound) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::Timeout(format!(
                    "transaction {} not executed after {:?}",
                    hash,
                    checks.execution_timeout()
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(BridgeError::Timeout(format!("cancelled waiting for {}", hash)));
                }
                _ = tokio::time::sleep(checks.time_between_checks()) => {}
            }
        }
    }

    async fn handle_error(&self, cancel: &CancellationToken) {
        let checks = &self.config.transaction_checks;
        if checks.close_app_on_error {
            warn!("[SCExecutor] Requesting shutdown after failed operation");
            // A full channel already carries a pending shutdown request
            let _ = self.close_app.try_send(());
        }
        let delay = checks.extra_delay_on_error();
        if delay > Duration::ZERO {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let polling_interval = Duration::from_millis(self.config.polling_interval_ms);
        tokio::spawn(async move {
            info!("[SCExecutor] Polling {} every {:?}", self.sc_proxy, polling_interval);
            let mut interval = tokio::time::interval(polling_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[SCExecutor] Stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        match self.execute_cycle(&cancel).await {
                            Ok(0) => {}
                            Ok(executed) => info!("[SCExecutor] Executed {} operations", executed),
                            Err(e) => warn!("[SCExecutor] Cycle aborted: {}", e),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sc_executor::call_data::{encode_call_data, CallData};
    use crate::test_utils::{test_config, test_k_address, test_k_keypair, MockKProxy};
    use ethers::types::{Address as EthAddress, U256};

    const MAX_GAS_LIMIT_TO_USE: u64 = 100_000_000;

    struct Harness {
        proxy: Arc<MockKProxy>,
        executor: ScCallExecutor,
        close_rx: mpsc::Receiver<()>,
    }

    fn harness(configure: impl FnOnce(&mut ScCallsConfig)) -> Harness {
        let proxy = Arc::new(MockKProxy::new());
        let metrics = Arc::new(BridgeMetrics::new_for_testing());
        let mut config = test_config().sc_calls;
        config.max_gas_limit_to_use = MAX_GAS_LIMIT_TO_USE;
        config.transaction_checks.time_between_checks_s = 0;
        config.transaction_checks.extra_delay_on_error_s = 0;
        configure(&mut config);
        let (close_tx, close_rx) = mpsc::channel(1);
        let executor = ScCallExecutor::new(
            proxy.clone(),
            Arc::new(NonceTransactionHandler::new(
                proxy.clone(),
                Duration::from_secs(60),
                metrics.clone(),
            )),
            Arc::new(KTxSigner::new(Arc::new(test_k_keypair(9))).unwrap()),
            PendingOperationFilter::new(&config.filter).unwrap(),
            test_k_address(0x33),
            config,
            "local".to_string(),
            close_tx,
            metrics,
        );
        Harness {
            proxy,
            executor,
            close_rx,
        }
    }

    fn operation(function: &str, gas_limit: u64, nonce: u64) -> ProxySCCompleteCallData {
        ProxySCCompleteCallData {
            from: EthAddress::repeat_byte(0x01),
            to: Some(test_k_address(0xaa)),
            token: "USDC-abcdef".to_string(),
            amount: U256::from(5000),
            nonce,
            raw_call_data: encode_call_data(&CallData {
                function: function.to_string(),
                gas_limit,
                arguments: None,
            }),
        }
    }

    fn pending_response(operations: &[(u64, ProxySCCompleteCallData)]) -> Vec<Vec<u8>> {
        operations
            .iter()
            .flat_map(|(id, op)| [id.to_be_bytes().to_vec(), op.encode()])
            .collect()
    }

    #[test]
    fn test_plan_gas_thresholds() {
        let h = harness(|_| {});
        let extra = test_config().sc_calls.extra_gas_to_execute;
        assert_eq!(
            h.executor.plan(&operation("deposit", 1_000_000, 1)),
            OperationPlan::Execute {
                gas_limit: 1_000_000 + extra
            }
        );
        assert_eq!(
            h.executor.plan(&operation("deposit", MAX_GAS_LIMIT_TO_USE + 1, 1)),
            OperationPlan::Skip {
                reason: "gas_too_high"
            }
        );
        // Above what any contract can use: sent with the out-of-gas limit so it refunds
        assert_eq!(
            h.executor.plan(&operation("deposit", CONTRACT_MAX_GAS_LIMIT, 1)),
            OperationPlan::Execute {
                gas_limit: test_config().sc_calls.gas_limit_for_out_of_gas_transactions
            }
        );
        // Undecodable call data still goes out with the extra gas only
        let mut broken = operation("deposit", 1, 1);
        broken.raw_call_data = vec![0x07];
        assert_eq!(
            h.executor.plan(&broken),
            OperationPlan::Execute { gas_limit: extra }
        );
    }

    #[test]
    fn test_plan_applies_filter() {
        let h = harness(|config| {
            config.filter.denied_tokens = vec!["USDC-abcdef".to_string()];
        });
        assert_eq!(
            h.executor.plan(&operation("deposit", 1, 1)),
            OperationPlan::Skip { reason: "filtered" }
        );
    }

    #[tokio::test]
    async fn test_gas_too_high_is_skipped_others_proceed() {
        let h = harness(|_| {});
        h.proxy.set_vm_response(
            GET_PENDING_TRANSACTIONS,
            pending_response(&[
                (1, operation("deposit", MAX_GAS_LIMIT_TO_USE + 1, 1)),
                (2, operation("deposit", 1_000_000, 2)),
            ]),
        );

        let executed = h
            .executor
            .execute_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(executed, 1);
        let sent = h.proxy.sent_transactions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, b"execute@02".to_vec());
        assert_eq!(sent[0].receiver, test_k_address(0x33).to_bech32());
        assert_eq!(
            h.executor
                .metrics
                .sc_calls_skipped
                .with_label_values(&["gas_too_high"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_function_is_still_executed() {
        // The SC proxy refunds calls it cannot dispatch; the executor only triggers them
        let h = harness(|_| {});
        h.proxy.set_vm_response(
            GET_PENDING_TRANSACTIONS,
            pending_response(&[(5, operation("doesNotExist", 2_000_000, 1))]),
        );
        let executed = h
            .executor
            .execute_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(executed, 1);
        assert_eq!(h.proxy.sent_transactions()[0].data, b"execute@05".to_vec());
    }

    #[tokio::test]
    async fn test_failed_execution_aborts_cycle_and_closes_app() {
        let mut h = harness(|config| {
            config.transaction_checks.close_app_on_error = true;
        });
        h.proxy.set_default_tx_status(Some(TransactionStatus::Failed));
        h.proxy.set_vm_response(
            GET_PENDING_TRANSACTIONS,
            pending_response(&[
                (1, operation("deposit", 1_000_000, 1)),
                (2, operation("deposit", 1_000_000, 2)),
            ]),
        );

        let result = h.executor.execute_cycle(&CancellationToken::new()).await;
        assert!(matches!(result, Err(BridgeError::ExecutionFailed(_))));
        assert_eq!(h.proxy.sent_transactions().len(), 1);
        assert!(h.close_rx.try_recv().is_ok());
        assert_eq!(h.executor.metrics.sc_calls_failed.get(), 1);
    }

    #[tokio::test]
    async fn test_missing_result_times_out() {
        let h = harness(|config| {
            config.transaction_checks.execution_timeout_s = 0;
        });
        h.proxy.set_default_tx_status(None);
        h.proxy.set_vm_response(
            GET_PENDING_TRANSACTIONS,
            pending_response(&[(1, operation("deposit", 1_000_000, 1))]),
        );
        let result = h.executor.execute_cycle(&CancellationToken::new()).await;
        assert!(matches!(result, Err(BridgeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_unchecked_results_do_not_poll() {
        let h = harness(|config| {
            config.transaction_checks.check_transaction_results = false;
        });
        h.proxy.set_default_tx_status(Some(TransactionStatus::Failed));
        h.proxy.set_vm_response(
            GET_PENDING_TRANSACTIONS,
            pending_response(&[(1, operation("deposit", 1_000_000, 1))]),
        );
        assert_eq!(
            h.executor
                .execute_cycle(&CancellationToken::new())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_odd_response_is_protocol_error() {
        let h = harness(|_| {});
        h.proxy
            .set_vm_response(GET_PENDING_TRANSACTIONS, vec![vec![1]]);
        assert!(matches!(
            h.executor.execute_cycle(&CancellationToken::new()).await,
            Err(BridgeError::Decode(_))
        ));
        assert!(h.proxy.sent_transactions().is_empty());
    }
}
