// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::balance_validator::BalanceValidator;
use crate::config::BridgeNodeConfig;
use crate::crypto::{ed25519_public_key_bytes, EthMessageSigner, KMessageSigner, KTxSigner};
use crate::error::BridgeError;
use crate::eth_client::EthBridgeClient;
use crate::gossip::server::{run_metrics_server, run_server, BridgeNodePublicMetadata};
use crate::gossip::{GossipConfig, GossipOverlay, HttpMessenger, PeerId, SignatureStore};
use crate::k_client::KBridgeClient;
use crate::k_proxy::{KProxy, KProxyClient};
use crate::metrics::BridgeMetrics;
use crate::nonce_handler::NonceTransactionHandler;
use crate::orchestrator::{Orchestrator, OrchestratorConfig, ShutdownReason};
use crate::relay::{
    BatchRelayStateMachine, BridgeChainClient, SignerSet, StateMachineConfig, TokenMapper,
};
use crate::retry_with_max_elapsed_time;
use crate::sc_executor::ScCallExecutor;
use crate::types::Direction;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const K_PROXY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const GOSSIP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const ETH_CLIENT_MAX_ELAPSED_TIME: Duration = Duration::from_secs(600);
const INBOUND_QUEUE_SIZE: usize = 10_000;

fn to_anyhow(e: BridgeError) -> anyhow::Error {
    anyhow::anyhow!("{}", e)
}

/// Wires every component from `config` and runs the relayer until `cancel` fires or a
/// component asks for a shutdown.
pub async fn run_bridge_node(
    config: BridgeNodeConfig,
    version: &'static str,
    registry: prometheus::Registry,
    cancel: CancellationToken,
) -> anyhow::Result<ShutdownReason> {
    let runtime = config.validate()?;
    let metrics = Arc::new(BridgeMetrics::new(&registry));

    let k_proxy: Arc<dyn KProxy> = Arc::new(
        KProxyClient::new(
            &config.k.network_address,
            config.k.proxy.clone(),
            K_PROXY_REQUEST_TIMEOUT,
            metrics.clone(),
        )
        .map_err(to_anyhow)?,
    );
    let nonce_handler = Arc::new(NonceTransactionHandler::new(
        k_proxy.clone(),
        Duration::from_secs(config.k.interval_to_resend_txs_s),
        metrics.clone(),
    ));
    let relayer_signer = Arc::new(KTxSigner::new(runtime.k_keypair.clone()).map_err(to_anyhow)?);
    let k_client = Arc::new(KBridgeClient::new(
        k_proxy.clone(),
        nonce_handler.clone(),
        relayer_signer,
        runtime.k_safe,
        runtime.k_multisig,
        config.k.gas_map.clone(),
        config.k.chain_id.clone(),
        config.k.client_availability_allow_delta,
        metrics.clone(),
    ));
    info!("Chain-K relayer address {}", k_client.relayer_address());

    let eth_client = Arc::new(retry_with_max_elapsed_time!(
        EthBridgeClient::new(
            &config.eth,
            runtime.eth_wallet.clone(),
            runtime.eth_safe,
            runtime.eth_multisig,
            metrics.clone(),
        ),
        ETH_CLIENT_MAX_ELAPSED_TIME
    )??);
    info!("Chain-E relayer address {:?}", eth_client.relayer_address());

    let own_pubkey = ed25519_public_key_bytes(&runtime.k_keypair);
    let peer_id = PeerId::new(
        config
            .relayer
            .p2p
            .peer_id
            .clone()
            .unwrap_or_else(|| k_client.relayer_address().to_bech32()),
    );
    let messenger = HttpMessenger::new(
        peer_id.clone(),
        config.relayer.p2p.peers.clone(),
        GOSSIP_REQUEST_TIMEOUT,
        metrics.clone(),
    )
    .map_err(to_anyhow)?;
    let store = Arc::new(SignatureStore::new());
    let overlay = Arc::new(GossipOverlay::new(
        GossipConfig::from_config(&config.relayer.p2p, &config.relayer.antiflood),
        runtime.k_keypair.clone(),
        store.clone(),
        Arc::new(messenger),
        metrics.clone(),
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
    let mut servers = vec![
        run_server(
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                config.relayer.p2p.listen_port,
            ),
            inbound_tx,
            registry.clone(),
            Arc::new(BridgeNodePublicMetadata::new(version, &peer_id, &own_pubkey)),
            cancel.clone(),
        )
        .await?,
    ];
    if config.metrics_port != config.relayer.p2p.listen_port {
        servers.push(
            run_metrics_server(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.metrics_port),
                registry.clone(),
                cancel.clone(),
            )
            .await?,
        );
    }

    let mut orchestrator = Orchestrator::new(
        OrchestratorConfig {
            tick_interval: config.tick_interval(),
            execution_timeout: config.execution_timeout(),
            status_check_interval: Duration::from_secs(config.relayer.status_check_interval_s),
            configured_relayers: runtime.whitelisted_relayers.clone(),
        },
        overlay.clone(),
        inbound_rx,
        k_client.clone(),
        eth_client.clone(),
        cancel.clone(),
        metrics.clone(),
    );

    let signers = SignerSet {
        eth: Arc::new(EthMessageSigner::new(runtime.eth_wallet.clone())),
        k: Arc::new(KMessageSigner::new(runtime.k_keypair.clone())),
    };
    let balance_validator = Arc::new(BalanceValidator::new(eth_client.clone(), k_client.clone()));
    let state_machine_config = StateMachineConfig {
        quorum_timeout_ticks: config.relayer.quorum_timeout_ticks,
        confirmation_timeout_ticks: config.relayer.confirmation_timeout_ticks,
    };
    for direction in [Direction::EthToK, Direction::KToEth] {
        let (source, destination): (Arc<dyn BridgeChainClient>, Arc<dyn BridgeChainClient>) =
            match direction {
                Direction::EthToK => (eth_client.clone(), k_client.clone()),
                Direction::KToEth => (k_client.clone(), eth_client.clone()),
            };
        orchestrator.add_state_machine(BatchRelayStateMachine::new(
            direction,
            source,
            destination,
            Arc::new(TokenMapper::new(direction, k_client.clone())),
            balance_validator.clone(),
            signers.clone(),
            overlay.clone(),
            store.clone(),
            state_machine_config.clone(),
            metrics.clone(),
        ));
    }

    if config.sc_calls.enabled {
        let executor_signer =
            Arc::new(KTxSigner::new(runtime.executor_keypair.clone()).map_err(to_anyhow)?);
        info!("SC calls executed by {}", executor_signer.address());
        orchestrator.set_executor(Arc::new(ScCallExecutor::new(
            k_proxy,
            nonce_handler.clone(),
            executor_signer,
            runtime.filter,
            runtime.sc_proxy,
            config.sc_calls.clone(),
            config.k.chain_id.clone(),
            orchestrator.close_app_sender(),
            metrics.clone(),
        )));
    } else {
        info!("SC call execution disabled");
    }
    orchestrator.set_nonce_handler(nonce_handler);

    info!("Relayer {} started", peer_id);
    let reason = orchestrator.run().await;
    for server in servers {
        if let Err(e) = server.await {
            warn!("Server task ended abnormally: {:?}", e);
        }
    }
    Ok(reason)
}
