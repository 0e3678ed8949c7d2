// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Owns the long running tasks of a relayer and their shared cancellation token.
//!
//! Every loop observes the same token. A fatal relay error, or a close request from the
//! SC-call executor, cancels it; each loop then finishes its current step and exits.

use crate::error::BridgeResult;
use crate::eth_client::EthBridgeClient;
use crate::gossip::{GossipOverlay, InboundMessage};
use crate::k_client::KBridgeClient;
use crate::metrics::BridgeMetrics;
use crate::nonce_handler::NonceTransactionHandler;
use crate::relay::BatchRelayStateMachine;
use crate::sc_executor::ScCallExecutor;
use async_trait::async_trait;
use ethers::providers::JsonRpcClient;
use ethers::types::Address as EthAddress;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Chain-side view used by the periodic status check.
#[async_trait]
pub trait RelayerBoard: Send + Sync {
    /// Ed25519 keys of the relayers allowed to sign.
    async fn staked_relayers(&self) -> BridgeResult<Vec<Vec<u8>>>;
    async fn check_availability(&self) -> bool;
}

#[async_trait]
impl RelayerBoard for KBridgeClient {
    async fn staked_relayers(&self) -> BridgeResult<Vec<Vec<u8>>> {
        self.get_all_staked_relayers().await
    }

    async fn check_availability(&self) -> bool {
        KBridgeClient::check_availability(self).await
    }
}

/// Chain-E relayer addresses, the signers a Chain-E quorum is counted over.
#[async_trait]
pub trait EthSignerBoard: Send + Sync {
    async fn eth_signers(&self) -> BridgeResult<Vec<EthAddress>>;
}

#[async_trait]
impl<P> EthSignerBoard for EthBridgeClient<P>
where
    P: JsonRpcClient + Clone + 'static,
{
    async fn eth_signers(&self) -> BridgeResult<Vec<EthAddress>> {
        self.get_relayers().await
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub tick_interval: Duration,
    // Upper bound of a single tick
    pub execution_timeout: Duration,
    pub status_check_interval: Duration,
    pub configured_relayers: Vec<Vec<u8>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    Cancelled,
    CloseRequested,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    machines: Vec<BatchRelayStateMachine>,
    overlay: Arc<GossipOverlay>,
    inbound: mpsc::Receiver<InboundMessage>,
    board: Arc<dyn RelayerBoard>,
    eth_board: Arc<dyn EthSignerBoard>,
    executor: Option<Arc<ScCallExecutor>>,
    nonce_handler: Option<Arc<NonceTransactionHandler>>,
    cancel: CancellationToken,
    close_tx: mpsc::Sender<()>,
    close_rx: mpsc::Receiver<()>,
    metrics: Arc<BridgeMetrics>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        overlay: Arc<GossipOverlay>,
        inbound: mpsc::Receiver<InboundMessage>,
        board: Arc<dyn RelayerBoard>,
        eth_board: Arc<dyn EthSignerBoard>,
        cancel: CancellationToken,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        // One pending request is enough to shut down
        let (close_tx, close_rx) = mpsc::channel(1);
        Self {
            config,
            machines: vec![],
            overlay,
            inbound,
            board,
            eth_board,
            executor: None,
            nonce_handler: None,
            cancel,
            close_tx,
            close_rx,
            metrics,
        }
    }

    /// Sender any component may use to request a process shutdown.
    pub fn close_app_sender(&self) -> mpsc::Sender<()> {
        self.close_tx.clone()
    }

    pub fn add_state_machine(&mut self, machine: BatchRelayStateMachine) {
        self.machines.push(machine);
    }

    pub fn set_executor(&mut self, executor: Arc<ScCallExecutor>) {
        self.executor = Some(executor);
    }

    pub fn set_nonce_handler(&mut self, nonce_handler: Arc<NonceTransactionHandler>) {
        self.nonce_handler = Some(nonce_handler);
    }

    /// Runs until the token is cancelled or a shutdown is requested, then joins every task.
    pub async fn run(self) -> ShutdownReason {
        let Orchestrator {
            config,
            machines,
            overlay,
            inbound,
            board,
            eth_board,
            executor,
            nonce_handler,
            cancel,
            close_tx,
            mut close_rx,
            metrics,
        } = self;

        let mut whitelist = WhitelistRefresher::new(
            overlay.clone(),
            board.clone(),
            eth_board,
            config.configured_relayers.clone(),
        );
        whitelist.refresh().await;
        let mut handles = vec![overlay.clone().spawn_ingest(inbound, cancel.clone())];
        if let Err(e) = overlay.broadcast_join().await {
            warn!("[Gossip] Join broadcast failed: {}", e);
        }

        for machine in machines {
            handles.push(spawn_relay_loop(
                machine,
                config.tick_interval,
                config.execution_timeout,
                cancel.clone(),
                close_tx.clone(),
                metrics.clone(),
            ));
        }
        if let Some(executor) = executor {
            handles.push(executor.start(cancel.clone()));
        }
        if let Some(nonce_handler) = nonce_handler {
            handles.push(nonce_handler.start_resend_loop(cancel.clone()));
        }
        handles.push(spawn_status_loop(
            whitelist,
            board,
            config.status_check_interval,
            cancel.clone(),
        ));
        drop(close_tx);

        let reason = tokio::select! {
            _ = cancel.cancelled() => ShutdownReason::Cancelled,
            Some(()) = close_rx.recv() => {
                warn!("Shutdown requested by a component");
                ShutdownReason::CloseRequested
            }
        };
        cancel.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Task ended abnormally: {:?}", e);
            }
        }
        info!("All relayer tasks stopped ({:?})", reason);
        reason
    }
}

fn spawn_relay_loop(
    mut machine: BatchRelayStateMachine,
    tick_interval: Duration,
    execution_timeout: Duration,
    cancel: CancellationToken,
    close_tx: mpsc::Sender<()>,
    metrics: Arc<BridgeMetrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let direction = machine.direction();
        info!("[{}] Relay loop started", direction);
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match tokio::time::timeout(execution_timeout, machine.tick()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("[{}] Stopping relay: {}", direction, e);
                    let _ = close_tx.try_send(());
                    break;
                }
                Err(_) => {
                    metrics
                        .relay_tick_errors
                        .with_label_values(&[&direction.to_string(), "timeout"])
                        .inc();
                    warn!(
                        "[{}] Tick in state {} exceeded {:?}",
                        direction,
                        machine.state(),
                        execution_timeout
                    );
                }
            }
        }
        info!("[{}] Relay loop stopped", direction);
    })
}

fn spawn_status_loop(
    mut whitelist: WhitelistRefresher,
    board: Arc<dyn RelayerBoard>,
    status_check_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(status_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires at once and the whitelist was just loaded
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    whitelist.refresh().await;
                    board.check_availability().await;
                }
            }
        }
    })
}

/// Keeps the overlay's whitelist at the configured keys plus the last staked board read,
/// and its Chain-E signer set at the last relayer list read from the bridge contract.
struct WhitelistRefresher {
    overlay: Arc<GossipOverlay>,
    board: Arc<dyn RelayerBoard>,
    eth_board: Arc<dyn EthSignerBoard>,
    configured: Vec<Vec<u8>>,
    last_staked: Vec<Vec<u8>>,
}

impl WhitelistRefresher {
    fn new(
        overlay: Arc<GossipOverlay>,
        board: Arc<dyn RelayerBoard>,
        eth_board: Arc<dyn EthSignerBoard>,
        configured: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            overlay,
            board,
            eth_board,
            configured,
            last_staked: vec![],
        }
    }

    async fn refresh(&mut self) {
        match self.board.staked_relayers().await {
            Ok(staked) => self.last_staked = staked,
            Err(e) => warn!("[Gossip] Could not read staked relayers: {}", e),
        }
        let keys: BTreeSet<Vec<u8>> = self
            .configured
            .iter()
            .chain(self.last_staked.iter())
            .cloned()
            .collect();
        self.overlay.set_whitelist(keys);

        match self.eth_board.eth_signers().await {
            Ok(signers) => self.overlay.set_eth_signers(signers),
            Err(e) => warn!("[Gossip] Could not read Chain-E relayers: {}", e),
        }
    }
}
