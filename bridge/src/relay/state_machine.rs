// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-direction batch relay: fetch, validate, propose, gather quorum, execute, confirm.
//!
//! Every externally visible step is guarded by a chain predicate (`was_proposed_*`,
//! `was_signed`, `was_executed`), so replaying a step after a crash or a transient
//! failure never double-spends. Transient errors leave the state untouched; any
//! other error rejects the in-flight batch, which is fetched again on the next
//! round.

use super::chain_client::BridgeChainClient;
use super::token_mapper::TokenMapper;
use crate::balance_validator::BalanceValidator;
use crate::crypto::MessageSigner;
use crate::encoding::{set_status_message_hash, transfer_message_hash};
use crate::error::{BridgeError, BridgeResult};
use crate::gossip::{SignatureBroadcaster, SignatureStore};
use crate::metrics::BridgeMetrics;
use crate::types::{
    Action, ActionKind, Batch, ChainKind, DepositStatus, Direction, TransactionStatus,
};
use ethers::types::{H256, U256};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const SIGNED_HASHES_CACHE_SIZE: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum RelayState {
    Idle,
    FetchingBatch,
    ValidatingBatch,
    Proposing,
    WaitingQuorum,
    Executing,
    WaitingConfirmation,
    Rejected,
}

impl RelayState {
    fn ordinal(&self) -> i64 {
        match self {
            RelayState::Idle => 0,
            RelayState::FetchingBatch => 1,
            RelayState::ValidatingBatch => 2,
            RelayState::Proposing => 3,
            RelayState::WaitingQuorum => 4,
            RelayState::Executing => 5,
            RelayState::WaitingConfirmation => 6,
            RelayState::Rejected => 7,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StateMachineConfig {
    pub quorum_timeout_ticks: u64,
    pub confirmation_timeout_ticks: u64,
}

/// One message signer per chain an action may target.
#[derive(Clone)]
pub struct SignerSet {
    pub eth: Arc<dyn MessageSigner>,
    pub k: Arc<dyn MessageSigner>,
}

impl SignerSet {
    fn for_chain(&self, chain: ChainKind) -> &Arc<dyn MessageSigner> {
        match chain {
            ChainKind::Eth => &self.eth,
            ChainKind::K => &self.k,
        }
    }
}

#[derive(Clone, Debug)]
struct InFlight {
    batch: Batch,
    action: Action,
    // Chain executing the action: the destination for transfers, the source for statuses
    target: ChainKind,
    statuses: Vec<DepositStatus>,
    ticks_in_state: u64,
    signed_on_chain: bool,
    tx_hash: Option<String>,
}

pub struct BatchRelayStateMachine {
    direction: Direction,
    source: Arc<dyn BridgeChainClient>,
    destination: Arc<dyn BridgeChainClient>,
    token_mapper: Arc<TokenMapper>,
    balance_validator: Arc<BalanceValidator>,
    signers: SignerSet,
    broadcaster: Arc<dyn SignatureBroadcaster>,
    store: Arc<SignatureStore>,
    config: StateMachineConfig,
    metrics: Arc<BridgeMetrics>,
    state: RelayState,
    in_flight: Option<InFlight>,
    // (batch id, kind) -> the only message hash this relayer ever signs for it
    signed_hashes: LruCache<(u64, ActionKind), H256>,
}

impl BatchRelayStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: Direction,
        source: Arc<dyn BridgeChainClient>,
        destination: Arc<dyn BridgeChainClient>,
        token_mapper: Arc<TokenMapper>,
        balance_validator: Arc<BalanceValidator>,
        signers: SignerSet,
        broadcaster: Arc<dyn SignatureBroadcaster>,
        store: Arc<SignatureStore>,
        config: StateMachineConfig,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        let size = NonZeroUsize::new(SIGNED_HASHES_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            direction,
            source,
            destination,
            token_mapper,
            balance_validator,
            signers,
            broadcaster,
            store,
            config,
            metrics,
            state: RelayState::Idle,
            in_flight: None,
            signed_hashes: LruCache::new(size),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn current_action(&self) -> Option<&Action> {
        self.in_flight.as_ref().map(|f| &f.action)
    }

    fn client_for(&self, chain: ChainKind) -> &Arc<dyn BridgeChainClient> {
        if self.source.chain() == chain {
            &self.source
        } else {
            &self.destination
        }
    }

    fn set_state(&mut self, state: RelayState) {
        if self.state != state {
            debug!("[{}] {} -> {}", self.direction, self.state, state);
        }
        self.state = state;
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.ticks_in_state = 0;
        }
    }

    fn in_flight(&self) -> BridgeResult<&InFlight> {
        self.in_flight.as_ref().ok_or_else(|| {
            BridgeError::Fatal(format!("{} has no batch in state {}", self.direction, self.state))
        })
    }

    fn in_flight_mut(&mut self) -> BridgeResult<&mut InFlight> {
        let (direction, state) = (self.direction, self.state);
        self.in_flight.as_mut().ok_or_else(|| {
            BridgeError::Fatal(format!("{} has no batch in state {}", direction, state))
        })
    }

    /// Advances by at most one step. Only `Fatal` errors escape.
    pub async fn tick(&mut self) -> BridgeResult<()> {
        let state = self.state;
        let result = match state {
            RelayState::Idle | RelayState::FetchingBatch => self.fetch_batch().await,
            RelayState::ValidatingBatch => self.validate_batch().await,
            RelayState::Proposing => self.propose().await,
            RelayState::WaitingQuorum => self.wait_for_quorum().await,
            RelayState::Executing => self.execute().await,
            RelayState::WaitingConfirmation => self.wait_for_confirmation().await,
            RelayState::Rejected => {
                self.in_flight = None;
                self.set_state(RelayState::Idle);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.metrics
                .relay_tick_errors
                .with_label_values(&[&self.direction.to_string(), e.error_type()])
                .inc();
            if e.is_fatal() {
                error!("[{}] Fatal error in state {}: {}", self.direction, state, e);
                self.update_state_gauge();
                return Err(e);
            }
            if e.is_transient() {
                debug!("[{}] Transient error in state {}: {}", self.direction, state, e);
            } else {
                self.reject(e);
            }
        }
        self.update_state_gauge();
        Ok(())
    }

    fn update_state_gauge(&self) {
        self.metrics
            .relay_state
            .with_label_values(&[&self.direction.to_string()])
            .set(self.state.ordinal());
    }

    fn reject(&mut self, reason: BridgeError) {
        let batch_id = self.in_flight.as_ref().map(|f| f.batch.batch_id).unwrap_or_default();
        warn!(
            "[{}] Rejecting batch {} in state {}: {}",
            self.direction, batch_id, self.state, reason
        );
        self.metrics
            .relay_batches_rejected
            .with_label_values(&[&self.direction.to_string(), reason.error_type()])
            .inc();
        self.set_state(RelayState::Rejected);
    }

    async fn fetch_batch(&mut self) -> BridgeResult<()> {
        self.set_state(RelayState::FetchingBatch);
        self.in_flight = None;

        if self.destination.is_paused().await? {
            debug!("[{}] Destination is paused", self.direction);
            self.set_state(RelayState::Idle);
            return Ok(());
        }

        let batch = match self.direction {
            Direction::EthToK => {
                let last_executed = self.destination.get_last_executed_batch_id().await?;
                self.source.get_batch(last_executed + 1).await?
            }
            Direction::KToEth => self.source.get_pending_batch().await?,
        };
        let Some(batch) = batch.filter(|b| !b.is_empty()) else {
            self.set_state(RelayState::Idle);
            return Ok(());
        };

        let action_id = self
            .destination
            .get_action_id_for(ActionKind::Transfer, &batch, &[])
            .await?;
        let transfer = Action {
            kind: ActionKind::Transfer,
            batch_id: batch.batch_id,
            message_hash: H256::zero(),
            action_id,
        };
        if !self.destination.was_executed(&transfer).await? {
            info!(
                "[{}] Fetched batch {} with {} deposits",
                self.direction,
                batch.batch_id,
                batch.deposits.len()
            );
            self.begin(ActionKind::Transfer, batch, vec![], self.direction.destination(), action_id);
            self.set_state(RelayState::ValidatingBatch);
            return Ok(());
        }

        // Executed on Chain-E but the Chain-K safe still holds the batch as pending
        if self.direction == Direction::KToEth {
            return self.begin_set_status(batch).await;
        }
        debug!("[{}] Batch {} already executed", self.direction, batch.batch_id);
        self.set_state(RelayState::Idle);
        Ok(())
    }

    async fn begin_set_status(&mut self, batch: Batch) -> BridgeResult<()> {
        let Some(statuses) = self
            .destination
            .get_statuses_after_execution(batch.batch_id)
            .await?
        else {
            debug!("[{}] Statuses of batch {} not final yet", self.direction, batch.batch_id);
            self.set_state(RelayState::Idle);
            return Ok(());
        };
        let target = self.direction.source();
        let message_hash = set_status_message_hash(target, batch.batch_id, &statuses);
        let action_id = self
            .client_for(target)
            .get_action_id_for(ActionKind::SetStatus, &batch, &statuses)
            .await?;
        info!(
            "[{}] Setting statuses {:?} for batch {}",
            self.direction, statuses, batch.batch_id
        );
        self.begin(ActionKind::SetStatus, batch, statuses, target, action_id);
        self.in_flight_mut()?.action.message_hash = message_hash;
        self.set_state(RelayState::Proposing);
        Ok(())
    }

    fn begin(
        &mut self,
        kind: ActionKind,
        batch: Batch,
        statuses: Vec<DepositStatus>,
        target: ChainKind,
        action_id: u64,
    ) {
        self.metrics
            .relay_current_batch_id
            .with_label_values(&[&self.direction.to_string()])
            .set(batch.batch_id as i64);
        self.in_flight = Some(InFlight {
            action: Action {
                kind,
                batch_id: batch.batch_id,
                message_hash: H256::zero(),
                action_id,
            },
            batch,
            target,
            statuses,
            ticks_in_state: 0,
            signed_on_chain: false,
            tx_hash: None,
        });
    }

    async fn validate_batch(&mut self) -> BridgeResult<()> {
        let in_flight = self.in_flight()?;
        let mut batch = in_flight.batch.clone();
        let target = in_flight.target;

        // Cumulative transfer amount per token, in first-seen order
        let mut totals: Vec<(Vec<u8>, Vec<u8>, U256)> = vec![];
        for deposit in batch.deposits.iter_mut() {
            deposit.destination_token = self.token_mapper.convert_token(&deposit.source_token).await?;
            match totals.iter_mut().find(|(source, _, _)| *source == deposit.source_token) {
                Some((_, _, total)) => *total = total.saturating_add(deposit.transfer_amount()),
                None => totals.push((
                    deposit.source_token.clone(),
                    deposit.destination_token.clone(),
                    deposit.transfer_amount(),
                )),
            }
        }
        for (source_token, destination_token, amount) in &totals {
            let (eth_token, k_token) = match self.direction {
                Direction::EthToK => (source_token, destination_token),
                Direction::KToEth => (destination_token, source_token),
            };
            self.balance_validator
                .check_token(eth_token, k_token, *amount, self.direction)
                .await?;
        }

        let message_hash = transfer_message_hash(target, &batch)?;
        let in_flight = self.in_flight_mut()?;
        in_flight.batch = batch;
        in_flight.action.message_hash = message_hash;
        self.set_state(RelayState::Proposing);
        Ok(())
    }

    async fn propose(&mut self) -> BridgeResult<()> {
        let in_flight = self.in_flight()?.clone();
        let action = &in_flight.action;
        let client = self.client_for(in_flight.target).clone();

        // Chain-E has no on-chain proposal; signatures travel over gossip only
        if in_flight.target == ChainKind::K {
            match action.kind {
                ActionKind::Transfer => {
                    if !client.was_proposed_transfer(&in_flight.batch).await? {
                        let hash = client.propose_transfer(&in_flight.batch).await?;
                        info!("[{}] Proposed batch {} in tx {}", self.direction, action.batch_id, hash);
                    }
                }
                ActionKind::SetStatus => {
                    if !client
                        .was_proposed_set_status(action.batch_id, &in_flight.statuses)
                        .await?
                    {
                        let hash = client
                            .propose_set_status(action.batch_id, &in_flight.statuses)
                            .await?;
                        info!(
                            "[{}] Proposed statuses of batch {} in tx {}",
                            self.direction, action.batch_id, hash
                        );
                    }
                }
            }
        }

        let key = (action.batch_id, action.kind);
        if let Some(signed) = self.signed_hashes.get(&key) {
            if *signed != action.message_hash {
                return Err(BridgeError::Equivocation(format!(
                    "{} batch {} already signed as {:?}, refusing {:?}",
                    action.kind, action.batch_id, signed, action.message_hash
                )));
            }
        }
        let signature = self
            .signers
            .for_chain(in_flight.target)
            .sign_message_hash(&action.message_hash)?;
        self.signed_hashes.put(key, action.message_hash);

        self.broadcaster
            .broadcast_signature(action.message_hash, signature)
            .await?;
        self.metrics
            .relay_signatures_broadcast
            .with_label_values(&[&self.direction.to_string()])
            .inc();
        info!(
            "[{}] Signed {} of batch {}: {:?}",
            self.direction, action.kind, action.batch_id, action.message_hash
        );
        self.set_state(RelayState::WaitingQuorum);
        Ok(())
    }

    async fn wait_for_quorum(&mut self) -> BridgeResult<()> {
        let ticks = {
            let in_flight = self.in_flight_mut()?;
            in_flight.ticks_in_state += 1;
            in_flight.ticks_in_state
        };
        if ticks > self.config.quorum_timeout_ticks {
            let action = &self.in_flight()?.action;
            return Err(BridgeError::QuorumTimeout(format!(
                "{} of batch {} after {} ticks",
                action.kind, action.batch_id, self.config.quorum_timeout_ticks
            )));
        }

        let in_flight = self.in_flight()?.clone();
        let client = self.client_for(in_flight.target).clone();
        let quorum = client.get_quorum().await?;
        let collected = self.store.count(&in_flight.action.message_hash);
        if collected < quorum {
            debug!(
                "[{}] {}/{} signatures for batch {}",
                self.direction, collected, quorum, in_flight.action.batch_id
            );
        }

        if in_flight.target == ChainKind::K {
            let mut action_id = in_flight.action.action_id;
            if action_id == 0 {
                action_id = client
                    .get_action_id_for(in_flight.action.kind, &in_flight.batch, &in_flight.statuses)
                    .await?;
                if action_id == 0 {
                    debug!("[{}] Proposal not visible yet", self.direction);
                    return Ok(());
                }
                self.in_flight_mut()?.action.action_id = action_id;
            }
            if !in_flight.signed_on_chain && !client.was_signed(action_id).await? {
                let hash = client.sign(action_id).await?;
                debug!("[{}] Signed action {} in tx {}", self.direction, action_id, hash);
            }
            self.in_flight_mut()?.signed_on_chain = true;
            if !client.quorum_reached(action_id).await? {
                return Ok(());
            }
        }

        if collected >= quorum {
            info!(
                "[{}] Quorum of {} reached for batch {}",
                self.direction, quorum, in_flight.action.batch_id
            );
            self.set_state(RelayState::Executing);
        }
        Ok(())
    }

    async fn execute(&mut self) -> BridgeResult<()> {
        let in_flight = self.in_flight()?.clone();
        let client = self.client_for(in_flight.target).clone();

        if client.was_executed(&in_flight.action).await? {
            info!(
                "[{}] {} of batch {} was executed by another relayer",
                self.direction, in_flight.action.kind, in_flight.action.batch_id
            );
            return self.complete().await;
        }

        let quorum = client.get_quorum().await?;
        let signatures: Vec<Vec<u8>> = self
            .store
            .signatures(&in_flight.action.message_hash)
            .into_iter()
            .take(quorum)
            .map(|(_, signature)| signature)
            .collect();
        if signatures.len() < quorum {
            warn!(
                "[{}] Only {}/{} signatures left for batch {}",
                self.direction,
                signatures.len(),
                quorum,
                in_flight.action.batch_id
            );
            self.set_state(RelayState::WaitingQuorum);
            return Ok(());
        }

        let hash = client
            .perform_action(&in_flight.action, &in_flight.batch, &signatures)
            .await?;
        info!(
            "[{}] Executed {} of batch {} in tx {}",
            self.direction, in_flight.action.kind, in_flight.action.batch_id, hash
        );
        self.in_flight_mut()?.tx_hash = Some(hash);
        self.set_state(RelayState::WaitingConfirmation);
        Ok(())
    }

    async fn wait_for_confirmation(&mut self) -> BridgeResult<()> {
        let (ticks, in_flight) = {
            let in_flight = self.in_flight_mut()?;
            in_flight.ticks_in_state += 1;
            (in_flight.ticks_in_state, in_flight.clone())
        };
        let client = self.client_for(in_flight.target).clone();
        let tx_hash = in_flight.tx_hash.clone().ok_or_else(|| {
            BridgeError::Fatal(format!(
                "waiting for confirmation of batch {} without a tx hash",
                in_flight.action.batch_id
            ))
        })?;

        let status = match client.get_transaction_status(&tx_hash).await {
            Ok(status) => status,
            Err(e) if e.is_transient() && ticks <= self.config.confirmation_timeout_ticks => {
                return Err(e)
            }
            Err(e) if e.is_transient() => TransactionStatus::Pending,
            Err(e) => return Err(e),
        };
        match status {
            TransactionStatus::Success => self.complete().await,
            TransactionStatus::Pending if ticks <= self.config.confirmation_timeout_ticks => Ok(()),
            TransactionStatus::Pending | TransactionStatus::Failed => {
                // Someone else's execution may have landed first
                if client.was_executed(&in_flight.action).await? {
                    return self.complete().await;
                }
                Err(BridgeError::ExecutionFailed(format!(
                    "tx {} for batch {} ended as {:?} after {} ticks",
                    tx_hash, in_flight.action.batch_id, status, ticks
                )))
            }
        }
    }

    async fn complete(&mut self) -> BridgeResult<()> {
        let in_flight = self.in_flight()?.clone();
        self.store.clear(&in_flight.action.message_hash);
        self.metrics
            .relay_batches_executed
            .with_label_values(&[&self.direction.to_string(), &in_flight.action.kind.to_string()])
            .inc();
        info!(
            "[{}] {} of batch {} confirmed",
            self.direction, in_flight.action.kind, in_flight.action.batch_id
        );

        if self.direction == Direction::KToEth && in_flight.action.kind == ActionKind::Transfer {
            return self.begin_set_status(in_flight.batch).await;
        }
        self.in_flight = None;
        self.set_state(RelayState::Idle);
        Ok(())
    }
}
