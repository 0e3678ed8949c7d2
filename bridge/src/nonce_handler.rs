// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-sender nonce issuance for Chain-K transactions, with resend and gap detection.

use crate::error::{BridgeError, BridgeResult};
use crate::k_proxy::KProxy;
use crate::metrics::BridgeMetrics;
use crate::types::{KAddress, KTransaction};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct AddressNonceState {
    // Next nonce to hand out; None until seeded from the chain
    computed_nonce: Option<u64>,
    lowest_unconfirmed_nonce: u64,
    transactions: BTreeMap<u64, KTransaction>,
}

/// Owns the nonce counter and the unconfirmed transactions of one sender.
pub struct AddressNonceHandler {
    address: KAddress,
    proxy: Arc<dyn KProxy>,
    state: Mutex<AddressNonceState>,
    metrics: Arc<BridgeMetrics>,
}

impl AddressNonceHandler {
    pub fn new(address: KAddress, proxy: Arc<dyn KProxy>, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            address,
            proxy,
            state: Mutex::new(AddressNonceState::default()),
            metrics,
        }
    }

    pub fn address(&self) -> &KAddress {
        &self.address
    }

    pub async fn apply_nonce_and_gas_price(&self, tx: &mut KTransaction) -> BridgeResult<()> {
        let fees = self.proxy.estimate_transaction_fees(tx).await?;

        let mut state = self.state.lock().await;
        // Only a resubmission of the same payload counts; fresh txs all start at nonce 0
        if let Some(existing) = state.transactions.get(&tx.nonce) {
            if existing.data == tx.data
                && existing.gas_price == tx.gas_price
                && existing.kapp_fee == fees.kapp_fee
                && existing.bandwidth_fee == fees.bandwidth_fee
            {
                return Err(BridgeError::TxAlreadySent(tx.nonce));
            }
        }

        let account = self.proxy.get_account(&self.address).await?;
        if state.lowest_unconfirmed_nonce > account.nonce {
            self.metrics.nonce_gaps.inc();
            warn!(
                "[NonceHandler] Nonce gap for {}: lowest unconfirmed {} above account nonce {}",
                self.address, state.lowest_unconfirmed_nonce, account.nonce
            );
            // Re-seed from the chain on the next call
            state.computed_nonce = None;
            state.lowest_unconfirmed_nonce = account.nonce;
            return Err(BridgeError::GapNonce(account.nonce));
        }

        let nonce = state
            .computed_nonce
            .map_or(account.nonce, |computed| computed.max(account.nonce));
        state.computed_nonce = Some(nonce + 1);

        tx.nonce = nonce;
        tx.kapp_fee = fees.kapp_fee;
        tx.bandwidth_fee = fees.bandwidth_fee;
        debug!("[NonceHandler] Assigned nonce {} for {}", nonce, self.address);
        Ok(())
    }

    pub async fn send_transaction(&self, tx: &KTransaction) -> BridgeResult<String> {
        {
            let mut state = self.state.lock().await;
            if state.transactions.is_empty() || tx.nonce < state.lowest_unconfirmed_nonce {
                state.lowest_unconfirmed_nonce = tx.nonce;
            }
            state.transactions.insert(tx.nonce, tx.clone());
        }
        self.proxy.send_transaction(tx).await
    }

    /// Forgets confirmed transactions and rebroadcasts the rest.
    pub async fn resend_if_required(&self) -> BridgeResult<()> {
        let account = self.proxy.get_account(&self.address).await?;

        let to_resend: Vec<KTransaction> = {
            let mut state = self.state.lock().await;
            // Entries at or below the account nonce are settled
            state.transactions = state
                .transactions
                .split_off(&account.nonce.saturating_add(1));
            if state.transactions.is_empty() {
                state.lowest_unconfirmed_nonce = account.nonce;
                if state.computed_nonce == Some(account.nonce) {
                    state.computed_nonce = None;
                }
                return Ok(());
            }
            state.lowest_unconfirmed_nonce = state
                .transactions
                .keys()
                .next()
                .copied()
                .unwrap_or(account.nonce);
            state.transactions.values().cloned().collect()
        };

        info!(
            "[NonceHandler] Resending {} transactions for {} from nonce {}",
            to_resend.len(),
            self.address,
            account.nonce
        );
        let hashes = self.proxy.send_transactions(&to_resend).await?;
        self.metrics.txs_resent.inc_by(hashes.len() as u64);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn unconfirmed_nonces(&self) -> Vec<u64> {
        self.state.lock().await.transactions.keys().copied().collect()
    }

    #[cfg(test)]
    pub(crate) async fn lowest_unconfirmed_nonce(&self) -> u64 {
        self.state.lock().await.lowest_unconfirmed_nonce
    }
}

/// Routes every sender address to its own handler.
pub struct NonceTransactionHandler {
    proxy: Arc<dyn KProxy>,
    handlers: Mutex<HashMap<KAddress, Arc<AddressNonceHandler>>>,
    resend_interval: Duration,
    metrics: Arc<BridgeMetrics>,
}

impl NonceTransactionHandler {
    pub fn new(
        proxy: Arc<dyn KProxy>,
        resend_interval: Duration,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            proxy,
            handlers: Mutex::new(HashMap::new()),
            resend_interval,
            metrics,
        }
    }

    async fn handler_for(&self, address: &KAddress) -> Arc<AddressNonceHandler> {
        self.handlers
            .lock()
            .await
            .entry(*address)
            .or_insert_with(|| {
                Arc::new(AddressNonceHandler::new(
                    *address,
                    self.proxy.clone(),
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    fn sender_of(tx: &KTransaction) -> BridgeResult<KAddress> {
        KAddress::from_bech32(&tx.sender)
    }

    pub async fn apply_nonce_and_gas_price(&self, tx: &mut KTransaction) -> BridgeResult<()> {
        let sender = Self::sender_of(tx)?;
        self.handler_for(&sender)
            .await
            .apply_nonce_and_gas_price(tx)
            .await
    }

    pub async fn send_transaction(&self, tx: &KTransaction) -> BridgeResult<String> {
        let sender = Self::sender_of(tx)?;
        self.handler_for(&sender).await.send_transaction(tx).await
    }

    pub async fn resend_all(&self) {
        let handlers: Vec<Arc<AddressNonceHandler>> =
            self.handlers.lock().await.values().cloned().collect();
        for handler in handlers {
            if let Err(e) = handler.resend_if_required().await {
                error!(
                    "[NonceHandler] Resend for {} failed: {:?}",
                    handler.address(),
                    e
                );
            }
        }
    }

    pub fn start_resend_loop(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.resend_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[NonceHandler] Resend loop stopped");
                        return;
                    }
                    _ = interval.tick() => self.resend_all().await,
                }
            }
        })
    }
}
