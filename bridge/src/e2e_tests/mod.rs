// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Whole-federation flows: several relayers with their own overlay and signature store,
//! gossiping over an in-memory hub and driving shared in-memory chains.
//!
//! Ticks are interleaved in a seeded random order each round, so the tests cover
//! relayers racing on the same action without depending on wall-clock timing.

use crate::crypto::{ed25519_public_key_bytes, KTxSigner};
use crate::error::BridgeResult;
use crate::gossip::{
    GossipOverlay, InMemoryHub, InboundMessage, PeerId, SignatureBroadcaster, SignatureStore,
};
use crate::metrics::BridgeMetrics;
use crate::nonce_handler::NonceTransactionHandler;
use crate::relay::{BatchRelayStateMachine, BridgeChainClient, RelayState, StateMachineConfig};
use crate::sc_executor::call_data::encode_call_data;
use crate::sc_executor::{CallData, PendingOperationFilter, ProxySCCompleteCallData, ScCallExecutor};
use crate::test_utils::{
    init_test_logging, test_config, test_gossip_config, test_k_address, test_k_keypair,
    test_relayer, test_state_machine_with, MockChainClient, MockKProxy,
};
use crate::types::{ActionKind, ChainKind, Deposit, DepositStatus, Direction};
use async_trait::async_trait;
use ethers::signers::Signer as _;
use ethers::types::{Address as EthAddress, H256, U256};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_ROUNDS: usize = 60;

/// Gossips through the overlay and remembers what it sent.
struct CountingBroadcaster {
    overlay: Arc<GossipOverlay>,
    sent: Mutex<Vec<H256>>,
}

#[async_trait]
impl SignatureBroadcaster for CountingBroadcaster {
    async fn broadcast_signature(&self, message_hash: H256, signature: Vec<u8>) -> BridgeResult<()> {
        self.sent.lock().unwrap().push(message_hash);
        self.overlay.broadcast_signature(message_hash, signature).await
    }
}

struct Relayer {
    overlay: Arc<GossipOverlay>,
    inbound: mpsc::Receiver<InboundMessage>,
    broadcaster: Arc<CountingBroadcaster>,
    machines: Vec<BatchRelayStateMachine>,
}

impl Relayer {
    async fn drain_inbound(&mut self) {
        while let Ok(message) = self.inbound.try_recv() {
            let _ = self.overlay.process_received_message(&message).await;
        }
    }

    fn is_idle(&self) -> bool {
        self.machines.iter().all(|m| m.state() == RelayState::Idle)
    }
}

struct Federation {
    eth: MockChainClient,
    k: MockChainClient,
    relayers: Vec<Relayer>,
    rng: StdRng,
}

impl Federation {
    /// `size` relayers running both directions, quorum `size` on both chains.
    fn new(size: u8, seed: u64) -> Self {
        init_test_logging();
        let eth = MockChainClient::new(ChainKind::Eth);
        let k = MockChainClient::new(ChainKind::K);
        eth.set_quorum(size as usize);
        k.set_quorum(size as usize);

        let hub = InMemoryHub::new();
        let identities: Vec<_> = (1..=size).map(test_relayer).collect();
        let whitelist: Vec<Vec<u8>> = identities
            .iter()
            .map(|r| ed25519_public_key_bytes(&r.k_keypair))
            .collect();
        let eth_signers: Vec<EthAddress> =
            identities.iter().map(|r| r.eth_wallet.address()).collect();

        let relayers = identities
            .iter()
            .enumerate()
            .map(|(i, identity)| {
                let name = format!("relayer-{}", i);
                let (messenger, inbound) = hub.register(PeerId::new(name.clone()));
                let store = Arc::new(SignatureStore::new());
                let overlay = Arc::new(GossipOverlay::new(
                    test_gossip_config(),
                    identity.k_keypair.clone(),
                    store.clone(),
                    Arc::new(messenger),
                    Arc::new(BridgeMetrics::new_for_testing()),
                ));
                overlay.set_whitelist(whitelist.clone());
                overlay.set_eth_signers(eth_signers.clone());
                let broadcaster = Arc::new(CountingBroadcaster {
                    overlay: overlay.clone(),
                    sent: Mutex::new(vec![]),
                });
                let machines = [Direction::EthToK, Direction::KToEth]
                    .into_iter()
                    .map(|direction| {
                        test_state_machine_with(
                            direction,
                            Arc::new(eth.for_signer(&name)),
                            Arc::new(k.for_signer(&name)),
                            identity,
                            broadcaster.clone(),
                            store.clone(),
                            StateMachineConfig {
                                quorum_timeout_ticks: 20,
                                confirmation_timeout_ticks: 20,
                            },
                        )
                    })
                    .collect();
                Relayer {
                    overlay,
                    inbound,
                    broadcaster,
                    machines,
                }
            })
            .collect();

        Self {
            eth,
            k,
            relayers,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    async fn round(&mut self) {
        let mut order: Vec<usize> = (0..self.relayers.len()).collect();
        order.shuffle(&mut self.rng);
        for i in order {
            let relayer = &mut self.relayers[i];
            relayer.drain_inbound().await;
            for machine in relayer.machines.iter_mut() {
                machine.tick().await.unwrap();
            }
        }
    }

    /// Runs rounds until `done` holds and every relayer is back to idle.
    async fn run_until(&mut self, done: impl Fn(&Federation) -> bool) {
        for _ in 0..MAX_ROUNDS {
            self.round().await;
            if done(self) && self.relayers.iter().all(Relayer::is_idle) {
                return;
            }
        }
        panic!("federation did not settle within {} rounds", MAX_ROUNDS);
    }

    fn broadcasts_per_relayer(&self) -> Vec<usize> {
        self.relayers
            .iter()
            .map(|r| r.broadcaster.sent.lock().unwrap().len())
            .collect()
    }
}

fn eth_sender() -> Vec<u8> {
    let mut from = vec![0u8; 20];
    from[19] = 1;
    from
}

fn eth_to_k_deposit(nonce: u64, amount: u64, call_data: Vec<u8>) -> Deposit {
    Deposit {
        deposit_nonce: nonce,
        from: eth_sender(),
        to: test_k_address(0xaa).as_bytes().to_vec(),
        source_token: b"usdc".to_vec(),
        amount: U256::from(amount),
        call_data,
        display_from: format!("0x{}", hex::encode(eth_sender())),
        display_to: test_k_address(0xaa).to_bech32(),
        display_token: "usdc".to_string(),
        ..Default::default()
    }
}

fn k_to_eth_deposit(nonce: u64, to: Vec<u8>, amount: u64, fee: u64) -> Deposit {
    Deposit {
        deposit_nonce: nonce,
        from: test_k_address(0xaa).as_bytes().to_vec(),
        display_to: format!("0x{}", hex::encode(&to)),
        to,
        source_token: b"USDC-abcdef".to_vec(),
        amount: U256::from(amount),
        fee: U256::from(fee),
        display_from: test_k_address(0xaa).to_bech32(),
        display_token: "USDC-abcdef".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_eth_to_k_three_relayers_execute_once() {
    let mut federation = Federation::new(3, 7);
    federation
        .eth
        .add_batch(1, vec![eth_to_k_deposit(1, 5000, vec![])]);

    federation
        .run_until(|f| f.k.last_executed_batch_id() == 1)
        .await;

    let performed = federation.k.performed();
    assert_eq!(performed.len(), 1);
    let (action, signatures) = &performed[0];
    assert_eq!(action.kind, ActionKind::Transfer);
    assert_eq!(action.action_id, 1);
    assert_eq!(signatures.len(), 3);
    assert!(federation.k.was_executed(action).await.unwrap());
    assert_eq!(federation.k.proposed_transfers(), vec![1]);
    assert_eq!(federation.broadcasts_per_relayer(), vec![1, 1, 1]);
    assert_eq!(
        federation.k.credited(test_k_address(0xaa).as_bytes()),
        U256::from(5000)
    );
    // Signatures are dropped once the action is confirmed
    for relayer in &federation.relayers {
        assert_eq!(relayer.overlay.store().count(&action.message_hash), 0);
    }
}

#[tokio::test]
async fn test_eth_to_k_settles_under_other_interleavings() {
    for seed in [1, 2, 3, 42] {
        let mut federation = Federation::new(3, seed);
        federation
            .eth
            .add_batch(1, vec![eth_to_k_deposit(1, 5000, vec![])]);
        federation
            .run_until(|f| f.k.last_executed_batch_id() == 1)
            .await;
        assert_eq!(federation.k.performed().len(), 1, "seed {}", seed);
    }
}

#[tokio::test]
async fn test_k_to_eth_credits_net_amount_and_keeps_fees() {
    let mut federation = Federation::new(3, 11);
    let receiver = vec![0x22; 20];
    federation.k.set_pending_batch(
        vec![
            k_to_eth_deposit(1, receiver.clone(), 2500, 50),
            k_to_eth_deposit(2, receiver.clone(), 300, 50),
        ],
        1,
    );

    federation
        .run_until(|f| {
            f.k.performed()
                .iter()
                .any(|(action, _)| action.kind == ActionKind::SetStatus)
        })
        .await;

    // (2500 - 50) + (300 - 50)
    assert_eq!(federation.eth.credited(&receiver), U256::from(2700));
    assert_eq!(federation.k.safe_fees(), U256::from(100));
    assert_eq!(federation.eth.performed().len(), 1);
    assert_eq!(
        federation.k.proposed_statuses(),
        vec![(1, vec![DepositStatus::Executed, DepositStatus::Executed])]
    );
    // A transfer signature and a status signature each
    assert_eq!(federation.broadcasts_per_relayer(), vec![2, 2, 2]);
}

#[tokio::test]
async fn test_faulty_sc_call_is_refunded_to_sender() {
    let mut federation = Federation::new(3, 5);
    let call_data = encode_call_data(&CallData {
        function: "functionThatDoesNotExist".to_string(),
        gas_limit: 5_000_000,
        arguments: None,
    });
    let deposit = eth_to_k_deposit(1, 1000, call_data.clone());
    federation.eth.add_batch(1, vec![deposit.clone()]);
    federation
        .run_until(|f| f.k.last_executed_batch_id() == 1)
        .await;

    // The SC proxy parked the call; the executor triggers it
    let proxy = Arc::new(MockKProxy::new());
    let parked = ProxySCCompleteCallData {
        from: EthAddress::from_slice(&deposit.from),
        to: Some(test_k_address(0xaa)),
        token: "USDC-abcdef".to_string(),
        amount: deposit.transfer_amount(),
        nonce: deposit.deposit_nonce,
        raw_call_data: call_data,
    };
    proxy.set_vm_response(
        "getPendingTransactions",
        vec![1u64.to_be_bytes().to_vec(), parked.encode()],
    );
    let metrics = Arc::new(BridgeMetrics::new_for_testing());
    let mut config = test_config().sc_calls;
    config.transaction_checks.time_between_checks_s = 0;
    config.transaction_checks.extra_delay_on_error_s = 0;
    let (close_tx, _close_rx) = mpsc::channel(1);
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
    let executed = executor
        .execute_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(executed, 1);
    assert_eq!(proxy.sent_transactions()[0].data, b"execute@01".to_vec());

    // The unknown function fails inside the contract, which refunds through the safe
    federation
        .k
        .set_pending_batch(vec![k_to_eth_deposit(1, eth_sender(), 1000, 50)], 1);
    federation
        .run_until(|f| {
            f.k.performed()
                .iter()
                .any(|(action, _)| action.kind == ActionKind::SetStatus)
        })
        .await;
    assert_eq!(federation.eth.credited(&eth_sender()), U256::from(950));
}
