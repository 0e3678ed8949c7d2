// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::BridgeResult;
use crate::types::{Action, ActionKind, Batch, ChainKind, DepositStatus, TransactionStatus};
use async_trait::async_trait;

/// What a relay state machine needs from one side of the bridge.
///
/// Every call is bounded by the caller's timeout; cancelling means dropping
/// the returned future.
#[async_trait]
pub trait BridgeChainClient: Send + Sync {
    fn chain(&self) -> ChainKind;

    /// The batch this chain's safe currently offers for bridging, if any.
    async fn get_pending_batch(&self) -> BridgeResult<Option<Batch>>;

    /// A final batch by id. A batch still collecting deposits is `None`.
    async fn get_batch(&self, batch_id: u64) -> BridgeResult<Option<Batch>>;

    /// Id of the last batch from the other chain executed here.
    async fn get_last_executed_batch_id(&self) -> BridgeResult<u64>;

    async fn was_proposed_transfer(&self, batch: &Batch) -> BridgeResult<bool>;

    async fn was_proposed_set_status(
        &self,
        batch_id: u64,
        statuses: &[DepositStatus],
    ) -> BridgeResult<bool>;

    /// Action id assigned by this chain's multisig, 0 when it has none yet.
    async fn get_action_id_for(
        &self,
        kind: ActionKind,
        batch: &Batch,
        statuses: &[DepositStatus],
    ) -> BridgeResult<u64>;

    async fn was_executed(&self, action: &Action) -> BridgeResult<bool>;

    async fn quorum_reached(&self, action_id: u64) -> BridgeResult<bool>;

    /// Whether this relayer already signed the action on chain.
    async fn was_signed(&self, action_id: u64) -> BridgeResult<bool>;

    async fn get_quorum(&self) -> BridgeResult<usize>;

    /// Final per-deposit statuses of an executed batch, `None` while not final.
    async fn get_statuses_after_execution(
        &self,
        batch_id: u64,
    ) -> BridgeResult<Option<Vec<DepositStatus>>>;

    async fn propose_transfer(&self, batch: &Batch) -> BridgeResult<String>;

    async fn propose_set_status(
        &self,
        batch_id: u64,
        statuses: &[DepositStatus],
    ) -> BridgeResult<String>;

    async fn sign(&self, action_id: u64) -> BridgeResult<String>;

    /// Submits the execute transaction; `signatures` holds exactly quorum entries.
    async fn perform_action(
        &self,
        action: &Action,
        batch: &Batch,
        signatures: &[Vec<u8>],
    ) -> BridgeResult<String>;

    async fn get_transaction_status(&self, hash: &str) -> BridgeResult<TransactionStatus>;

    /// Nonce of this relayer's account on the chain.
    async fn get_current_nonce(&self) -> BridgeResult<u64>;

    async fn is_paused(&self) -> BridgeResult<bool>;
}
